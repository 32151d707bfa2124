// Volume geometry for formatting: sectors per cluster, reserved sectors and FAT size
// chosen so the FATs hold every cluster entry and the data area meets the alignment policy

use super::constants::*;
use fat32mgr_core::format::MAX_NUM_SECTORS;
use fat32mgr_core::{ClusterAlignment, FormatParams, VolumeError};
use serde::Serialize;

/// Layout of a volume about to be formatted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    /// Number of data clusters (cluster numbers 2..num_clusters + 2)
    pub num_clusters: u32,
    /// Sectors covered by the volume, truncated to whole clusters
    pub total_sectors: u32,
}

impl Geometry {
    pub fn first_data_sector(&self) -> u32 {
        self.reserved_sectors + self.num_fats * self.sectors_per_fat
    }

    pub fn fat_start_sector(&self, fat_index: u32) -> u32 {
        self.reserved_sectors + fat_index * self.sectors_per_fat
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Number of FAT entries in use, including the two reserved ones
    pub fn num_entries(&self) -> u32 {
        self.num_clusters + FAT32_MIN_CLUSTER
    }

    pub fn data_bytes(&self) -> u64 {
        self.num_clusters as u64 * self.cluster_size() as u64
    }
}

fn round_up(value: i64, multiple: i64) -> i64 {
    (value + multiple - 1) / multiple * multiple
}

/// Smallest `x` in `lower..=upper` satisfying `valid`, given that `valid(upper)` holds
/// and `valid` is monotonic
fn lower_bound(mut lower: i64, mut upper: i64, valid: impl Fn(i64) -> bool) -> i64 {
    while lower < upper {
        let median = (lower + upper) / 2;
        if valid(median) {
            upper = median;
        } else {
            lower = median + 1;
        }
    }
    lower
}

/// (reserved sectors, sectors per FAT), or `None` if the FAT cannot be sized
fn fat_layout(num_sectors: i64, params: &FormatParams, spc: i64) -> Option<(i64, i64)> {
    let num_fats = FAT32_NUM_FATS as i64;
    let entries_per_sector = params.bytes_per_sector as i64 / FAT32_ENTRY_SIZE as i64;
    let min_reserved = params.min_num_reserved_sectors as i64;
    let limit = 1i64 << 31;

    match params.cluster_alignment {
        ClusterAlignment::None => {
            let entries = |spf: i64| (num_sectors - min_reserved - num_fats * spf) / spc + FAT32_MIN_CLUSTER as i64;
            let valid = |spf: i64| entries(spf) <= spf * entries_per_sector;

            let mut spf = 1i64;
            while !valid(spf) {
                spf *= 2;
                if spf >= limit {
                    return None;
                }
            }
            if spf > 1 {
                spf = lower_bound(spf / 2, spf, valid);
            }
            Some((min_reserved, spf))
        }

        ClusterAlignment::IntegralMultiple | ClusterAlignment::PowerOfTwoMultiple => {
            let align_fats = params.align_fats_to_clusters;
            let min_reserved0 = if align_fats { round_up(min_reserved, spc) } else { min_reserved };
            let entries = |header: i64| (num_sectors - header) / spc + FAT32_MIN_CLUSTER as i64;
            let valid = |header: i64| entries(header) <= (header - min_reserved0) / num_fats * entries_per_sector;

            // Header = reserved sectors + FATs
            let mut header = spc;
            while !valid(header) {
                header *= 2;
                if header >= limit {
                    return None;
                }
            }

            let alignment = if align_fats { num_fats * spc } else { spc };
            if params.cluster_alignment == ClusterAlignment::IntegralMultiple && header > alignment {
                let upper = header / alignment;
                header = lower_bound(upper / 2, upper, |m| valid(m * alignment)) * alignment;
            }

            loop {
                let mut spf = (entries(header) + entries_per_sector - 1) / entries_per_sector;
                if align_fats {
                    spf = round_up(spf, spc);
                }
                let reserved = header - num_fats * spf;
                if reserved >= min_reserved {
                    return Some((reserved, spf));
                }
                header += alignment;
                if header >= num_sectors {
                    return None;
                }
            }
        }
    }
}

/// Geometry for one cluster size, or `None` when that size cannot work
fn layout_for(num_sectors: u64, params: &FormatParams, sectors_per_cluster: u32) -> Option<Geometry> {
    if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > MAX_SECTORS_PER_CLUSTER {
        return None;
    }
    let spc = sectors_per_cluster as i64;
    let n = num_sectors as i64;
    let (reserved, spf) = fat_layout(n, params, spc)?;

    let header = reserved + FAT32_NUM_FATS as i64 * spf;
    let num_clusters = (n - header) / spc;
    let entries = num_clusters + FAT32_MIN_CLUSTER as i64;
    if num_clusters < 1 || entries > FAT32_MAX_CLUSTER as i64 {
        return None;
    }

    Some(Geometry {
        bytes_per_sector: params.bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors: reserved as u32,
        num_fats: FAT32_NUM_FATS,
        sectors_per_fat: spf as u32,
        num_clusters: num_clusters as u32,
        total_sectors: (header + num_clusters * spc) as u32,
    })
}

fn check_capacity(num_sectors: u64, params: &FormatParams) -> Result<(), VolumeError> {
    params.validate()?;
    if num_sectors < params.min_num_sectors as u64 {
        return Err(VolumeError::Capacity(format!(
            "device has {} sectors, at least {} are required",
            num_sectors, params.min_num_sectors
        )));
    }
    if num_sectors > MAX_NUM_SECTORS {
        return Err(VolumeError::Capacity(format!(
            "device has {} sectors, at most {} are supported",
            num_sectors, MAX_NUM_SECTORS
        )));
    }
    Ok(())
}

/// Compute the geometry for a device of `num_sectors` sectors and a fixed cluster size
pub fn compute_geometry(num_sectors: u64, params: &FormatParams, sectors_per_cluster: u32) -> Result<Geometry, VolumeError> {
    check_capacity(num_sectors, params)?;
    layout_for(num_sectors, params, sectors_per_cluster).ok_or_else(|| {
        VolumeError::Capacity(format!(
            "no valid FAT32 layout with {} sectors per cluster on {} sectors",
            sectors_per_cluster, num_sectors
        ))
    })
}

/// Cluster sizes (in sectors) for which a FAT32 layout exists on this device
pub fn valid_sectors_per_cluster(num_sectors: u64, params: &FormatParams) -> Vec<u32> {
    if check_capacity(num_sectors, params).is_err() {
        return Vec::new();
    }
    std::iter::successors(Some(MIN_SECTORS_PER_CLUSTER), |&spc| Some(spc * 2))
        .take_while(|&spc| spc <= MAX_SECTORS_PER_CLUSTER)
        .filter(|&spc| layout_for(num_sectors, params, spc).is_some())
        .collect()
}

/// Pick a cluster size (the requested one, the default, or the nearest valid one)
/// and compute its geometry
pub fn compute_geometry_auto(
    num_sectors: u64,
    params: &FormatParams,
    requested: Option<u32>,
) -> Result<Geometry, VolumeError> {
    check_capacity(num_sectors, params)?;
    let valid = valid_sectors_per_cluster(num_sectors, params);
    let wanted = requested.unwrap_or(DEFAULT_SECTORS_PER_CLUSTER);

    let chosen = if valid.contains(&wanted) {
        wanted
    } else if valid.contains(&DEFAULT_SECTORS_PER_CLUSTER) {
        DEFAULT_SECTORS_PER_CLUSTER
    } else {
        let wanted_log = 31 - wanted.max(1).leading_zeros() as i32;
        *valid
            .iter()
            .min_by_key(|spc| ((spc.trailing_zeros() as i32 - wanted_log).abs(), **spc))
            .ok_or_else(|| VolumeError::Capacity(format!("no valid FAT32 layout for {} sectors", num_sectors)))?
    };

    compute_geometry(num_sectors, params, chosen)
}
