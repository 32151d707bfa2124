use crate::VolumeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_MIN_NUM_SECTORS: u32 = 1 << 16;
pub const DEFAULT_MIN_NUM_RESERVED_SECTORS: u32 = 32;
pub const DEFAULT_FORMATTER_NAME: &str = "FAT32MGR";

/// Smallest reserved area a formatted volume may have
pub const MIN_NUM_RESERVED_SECTORS: u32 = 16;
/// Largest device the formatter accepts
pub const MAX_NUM_SECTORS: u64 = 1 << 30;
pub const SUPPORTED_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

/// Where the first data sector may fall relative to the cluster size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlignment {
    None,
    IntegralMultiple,
    PowerOfTwoMultiple,
}

impl ClusterAlignment {
    pub const ALL: [ClusterAlignment; 3] = [
        ClusterAlignment::None,
        ClusterAlignment::IntegralMultiple,
        ClusterAlignment::PowerOfTwoMultiple,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ClusterAlignment::None => "none",
            ClusterAlignment::IntegralMultiple => "integral",
            ClusterAlignment::PowerOfTwoMultiple => "power-of-two",
        }
    }
}

impl Default for ClusterAlignment {
    fn default() -> Self {
        ClusterAlignment::IntegralMultiple
    }
}

impl fmt::Display for ClusterAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClusterAlignment::None => "None",
            ClusterAlignment::IntegralMultiple => "Sectors per cluster multiplied by an integer",
            ClusterAlignment::PowerOfTwoMultiple => "Sectors per cluster multiplied by a power of 2",
        };
        f.write_str(text)
    }
}

impl FromStr for ClusterAlignment {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ClusterAlignment::ALL
            .iter()
            .copied()
            .find(|a| a.key() == lower || format!("{:?}", a).to_ascii_lowercase() == lower)
            .ok_or_else(|| VolumeError::InvalidInput(format!("unknown cluster alignment: {}", s)))
    }
}

/// Parameters that shape a freshly formatted volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatParams {
    pub bytes_per_sector: u32,
    pub min_num_sectors: u32,
    pub min_num_reserved_sectors: u32,
    pub cluster_alignment: ClusterAlignment,
    pub align_fats_to_clusters: bool,
    pub formatter_name: String,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            bytes_per_sector: DEFAULT_SECTOR_SIZE,
            min_num_sectors: DEFAULT_MIN_NUM_SECTORS,
            min_num_reserved_sectors: DEFAULT_MIN_NUM_RESERVED_SECTORS,
            cluster_alignment: ClusterAlignment::default(),
            align_fats_to_clusters: true,
            formatter_name: DEFAULT_FORMATTER_NAME.to_string(),
        }
    }
}

impl FormatParams {
    pub fn validate(&self) -> Result<(), VolumeError> {
        if !SUPPORTED_SECTOR_SIZES.contains(&self.bytes_per_sector) {
            return Err(VolumeError::InvalidInput(format!(
                "unsupported sector size: {}",
                self.bytes_per_sector
            )));
        }
        if self.min_num_reserved_sectors < MIN_NUM_RESERVED_SECTORS {
            return Err(VolumeError::InvalidInput(format!(
                "at least {} reserved sectors are required",
                MIN_NUM_RESERVED_SECTORS
            )));
        }
        if self.min_num_sectors as u64 > MAX_NUM_SECTORS {
            return Err(VolumeError::InvalidInput(format!(
                "minimum sector count {} exceeds {}",
                self.min_num_sectors, MAX_NUM_SECTORS
            )));
        }
        if !self.formatter_name.is_ascii() || self.formatter_name.len() > 8 {
            return Err(VolumeError::InvalidInput(format!(
                "formatter name must be at most 8 ASCII characters: {:?}",
                self.formatter_name
            )));
        }
        Ok(())
    }
}

/// Per-format choices that are not persisted preferences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatOptions {
    pub label: Option<String>,
    /// Requested cluster size in sectors; chosen automatically when absent
    pub sectors_per_cluster: Option<u32>,
    /// Volume serial number; random when absent
    pub volume_id: Option<u32>,
    /// Sectors preceding the volume on its disk (BPB hidden sectors)
    pub hidden_sectors: u32,
}
