//! Daemon configuration
//!
//! Location: `$VIRTLINK_CONFIG`, otherwise `~/.virtlink/config.json`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::bridge::BridgeConfig;
use crate::ssh::{ConnectionConfig, RetryPolicy};

pub const CONFIG_VERSION: u32 = 1;

/// Overrides the default config file location
pub const CONFIG_ENV: &str = "VIRTLINK_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// A managed hypervisor host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    /// Identifier used by the pool and the bridge query strings
    pub id: String,

    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Fallback `tracing` filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            log_filter: default_log_filter(),
            bridge: BridgeConfig::default(),
            retry: RetryPolicy::default(),
            hosts: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn host(&self, id: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.id == id)
    }

    /// Record a first-contact host key. Returns `true` if the entry changed;
    /// an already pinned key is never replaced.
    pub fn pin_host_key(&mut self, id: &str, key: &str) -> bool {
        match self.hosts.iter_mut().find(|h| h.id == id) {
            Some(entry) if entry.connection.host_key.is_empty() && !key.is_empty() => {
                entry.connection.host_key = key.to_string();
                true
            }
            _ => false,
        }
    }
}

/// `~/.virtlink`
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".virtlink"))
        .ok_or(StorageError::NoConfigDir)
}

/// Config file path, honouring [`CONFIG_ENV`]
pub fn config_file() -> Result<PathBuf, StorageError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(config_dir()?.join("config.json")),
    }
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk.
    ///
    /// A missing file yields the defaults. A corrupted file is backed up and
    /// replaced by the defaults.
    pub async fn load(&self) -> Result<AppConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AppConfig::default()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) if config.version > CONFIG_VERSION => Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            }),
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!("Config file {:?} corrupted: {}", self.path, e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted config backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted config: {}", backup_err)
                    }
                }
                Ok(AppConfig::default())
            }
        }
    }

    /// Write through a temporary file, then rename over the target
    pub async fn save(&self, config: &AppConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Copy the current file aside as `<name>.json.backup.<unix seconds>`
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let backup_path = self.path.with_extension(format!("json.backup.{}", stamp));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }
        Ok(backup_path)
    }
}
