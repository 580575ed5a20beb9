//! Engine configuration
//!
//! Read once when a worker is constructed; a running operation only
//! observes changes through the explicit speed-limit control path.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// 4/2012 - ten times the old buffer; large files over the network now
// reach speeds comparable to the usual file managers
pub const OPERATION_BUFFER: usize = 10 * 32768;
/// Smaller buffer for removable media (floppy, ZIP drives)
pub const REMOVABLE_DISK_COPY_BUFFER: usize = 65536;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Copy/Move throughput cap in bytes per second; None = unlimited
    pub speed_limit: Option<u64>,

    /// Ask before overwriting an existing target
    pub confirm_overwrite: bool,

    /// New copy/move operations wait until nothing else is running
    pub start_on_idle: bool,

    /// Copy buffer for fast media
    pub buffer_size: usize,

    /// Copy buffer when either side is removable media
    pub removable_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            speed_limit: None,
            confirm_overwrite: true,
            start_on_idle: false,
            buffer_size: OPERATION_BUFFER,
            removable_buffer_size: REMOVABLE_DISK_COPY_BUFFER,
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> PathBuf {
        ProjectDirs::from("com", "LightningOps", "LightningOps")
            .map(|dirs| dirs.config_dir().join("ops.toml"))
            .unwrap_or_else(|| PathBuf::from("./ops.toml"))
    }

    /// Load from disk, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Invalid config at {:?}: {}; using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&path, text)
    }
}
