//! Configuration for blobstream

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blobstream")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory holding blobs, registry and default downloads
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for materialized stream files
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// HTTP port for the range API
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Retain fetched blobs in the blob directory
    #[serde(default = "default_true")]
    pub save_blobs: bool,

    /// Serve ranges without ever materializing a full file
    #[serde(default)]
    pub streaming_only: bool,
}

fn default_http_port() -> u16 {
    5279
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            download_dir: None,
            http_port: default_http_port(),
            save_blobs: true,
            streaming_only: false,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get blobs directory
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Get stream registry database path
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.sled")
    }

    /// Get the effective download directory
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
