//! Configuration system for Tidewire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TIDEWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tidewire/config.toml
//!   3. ~/.config/tidewire/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{MAX_SNAPSHOT_ENTRY, MAX_UNSPLIT_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidewireConfig {
    pub network: NetworkConfig,
    pub tables: TableConfig,
    pub cache: CacheConfig,
    pub downloads: DownloadConfig,
    pub packages: PackageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Reliable payloads at or above this size are chunked.
    pub max_unsplit_payload: usize,
    /// Partially received chunked messages older than this are dropped.
    pub chunk_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Per-entry cap when reading a StringTable snapshot or delta.
    pub max_snapshot_entry_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the CRC-addressed download cache.
    pub root: PathBuf,
    /// Max cache bytes. 0 = unlimited.
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// How long one RequestFile may take before it fails.
    pub request_timeout_secs: u64,
    /// Largest file a host response may carry.
    pub max_file_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Where installed packages are unpacked.
    pub install_root: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_unsplit_payload: MAX_UNSPLIT_PAYLOAD,
            chunk_timeout_secs: 30,
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_snapshot_entry_bytes: MAX_SNAPSHOT_ENTRY,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("cache"),
            max_bytes: 0,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            max_file_bytes: 512 * 1024 * 1024,
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            install_root: data_dir().join("packages"),
        }
    }
}

impl NetworkConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

impl DownloadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tidewire")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("tidewire")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TidewireConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TidewireConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config from TOML text without touching the environment.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TIDEWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TidewireConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TIDEWIRE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TIDEWIRE_CACHE__ROOT") {
            self.cache.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TIDEWIRE_NETWORK__MAX_UNSPLIT_PAYLOAD") {
            if let Ok(n) = v.parse() {
                self.network.max_unsplit_payload = n;
            }
        }
        if let Ok(v) = std::env::var("TIDEWIRE_DOWNLOADS__REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.downloads.request_timeout_secs = n;
            }
        }
    }
}
