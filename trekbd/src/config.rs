//! Configuration for trekbd.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::trek::{DEFAULT_TIMEOUT_MS, PRODUCT_ID, VENDOR_ID};
use crate::error::ConfigError;
use crate::types::SECTOR_SIZE;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub nbd: NbdConfig,
}

/// Which medium backs the export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    File,
    Trek,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: Backend,
    /// Image path for the file backend.
    pub path: Option<PathBuf>,
    /// Create the image with this many bytes if it does not exist yet.
    pub create_size_bytes: Option<u64>,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Per-transfer USB timeout.
    pub timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            path: None,
            create_size_bytes: None,
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == Backend::File && self.path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "device.path",
                reason: "required for the file backend",
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "device.timeout_ms",
                reason: "must be > 0",
            });
        }
        if let Some(size) = self.create_size_bytes
            && (size == 0 || !size.is_multiple_of(SECTOR_SIZE as u64))
        {
            return Err(ConfigError::InvalidValue {
                field: "device.create_size_bytes",
                reason: "must be a non-zero multiple of 512",
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    pub address: String,
    pub read_only: bool,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            address: default_nbd_address(),
            read_only: false,
        }
    }
}

fn default_nbd_address() -> String {
    "0.0.0.0:10809".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse without validating. Callers that still apply overrides validate
    /// once they are done.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()
    }
}
