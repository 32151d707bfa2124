// Persisted engine preferences
// Stored as JSON under the user configuration directory

use crate::{FormatParams, VolumeError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = "fat32mgr";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub format: FormatParams,
    /// Clamp out-of-range date/time fields instead of dropping them
    pub fix_dir_entry_dates: bool,
    /// Byte written over unused clusters by the eraser
    pub filler_byte: u8,
    pub sort_ignore_case: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            format: FormatParams::default(),
            fix_dir_entry_dates: false,
            filler_byte: 0,
            sort_ignore_case: true,
        }
    }
}

impl EngineConfig {
    /// `<config dir>/fat32mgr/config.json`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, VolumeError> {
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config
            .format
            .validate()
            .map_err(|e| VolumeError::Configuration(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), VolumeError> {
        self.format.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved configuration to {}", path.display());
        Ok(())
    }
}
