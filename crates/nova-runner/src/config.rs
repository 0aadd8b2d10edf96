use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use nova_board::BoardSchema;
use nova_concurrency::ConcurrencyPolicy;

pub const DB_PATH_ENV: &str = "NOVA_DB_PATH";
pub const BOARD_PATH_ENV: &str = "NOVA_BOARD_PATH";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub datastore: DatastoreConfig,
    pub board: BoardConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub poller: PollerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub path: String,
    #[serde(flatten)]
    pub schema: BoardSchema,
    pub default_resource: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_seconds: u64,
    pub stale_timeout_minutes: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_seconds: 60, stale_timeout_minutes: 30 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datastore: DatastoreConfig { path: ".nova/nova.db".to_string() },
            board: BoardConfig {
                path: ".nova/board.json".to_string(),
                schema: BoardSchema::default(),
                default_resource: "papkot-ai".to_string(),
            },
            concurrency: ConcurrencyPolicy::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse nova.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            self.datastore.path = path;
        }
        if let Ok(path) = std::env::var(BOARD_PATH_ENV) {
            self.board.path = path;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datastore.path.trim().is_empty() {
            return Err(ConfigError::Missing("datastore.path"));
        }
        if self.board.path.trim().is_empty() {
            return Err(ConfigError::Missing("board.path"));
        }
        if self.board.default_resource.trim().is_empty() {
            return Err(ConfigError::Missing("board.default_resource"));
        }
        if self.concurrency.global_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency.global_pool_size",
                message: "must be at least 1".to_string(),
            });
        }
        if self.concurrency.per_resource_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency.per_resource_concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        if self.poller.interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "poller.interval_seconds",
                message: "must be at least 1".to_string(),
            });
        }
        if self.poller.stale_timeout_minutes == 0 || checked_minutes_to_secs(self.poller.stale_timeout_minutes).is_none() {
            return Err(ConfigError::Invalid {
                field: "poller.stale_timeout_minutes",
                message: format!("must be between 1 and {}", i64::MAX / 60),
            });
        }
        Ok(())
    }

    pub fn db_path(&self, root: &Path) -> PathBuf {
        resolve(root, &self.datastore.path)
    }

    pub fn board_path(&self, root: &Path) -> PathBuf {
        resolve(root, &self.board.path)
    }

    /// Saturates at `i64::MAX`; `validate` rejects values that would.
    pub fn stale_timeout_secs(&self) -> i64 {
        checked_minutes_to_secs(self.poller.stale_timeout_minutes).unwrap_or(i64::MAX)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(".nova").join("nova.toml")
    }
}

fn checked_minutes_to_secs(minutes: u64) -> Option<i64> {
    i64::try_from(minutes).ok()?.checked_mul(60)
}

fn resolve(root: &Path, path: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(path).to_string());
    if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    }
}
