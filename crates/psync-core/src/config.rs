use crate::{ChannelId, RECENT_ITEMS_LIMIT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub bulk_mutation_ms: u64,
    pub import_ms: u64,
    pub campaign_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            bulk_mutation_ms: 750,
            import_ms: 3_000,
            campaign_ms: 750,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tenant whose push messages this engine accepts.
    pub company_id: String,
    pub store_path: Option<PathBuf>,
    pub history_limit: usize,
    /// Processing records silent for longer than this are marked failed.
    pub stale_after_secs: u64,
    pub poll: PollConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            company_id: String::new(),
            store_path: None,
            history_limit: RECENT_ITEMS_LIMIT,
            stale_after_secs: 600,
            poll: PollConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self, channel: ChannelId) -> Duration {
        let ms = match channel {
            ChannelId::BulkMutation => self.poll.bulk_mutation_ms,
            ChannelId::Import => self.poll.import_ms,
            ChannelId::Campaign => self.poll.campaign_ms,
        };
        Duration::from_millis(ms.max(50))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit.clamp(1, RECENT_ITEMS_LIMIT)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("PSYNC_COMPANY_ID") {
            if !value.trim().is_empty() {
                self.company_id = value.trim().to_string();
            }
        }
        if let Ok(value) = env::var("PSYNC_STORE_PATH") {
            if !value.trim().is_empty() {
                self.store_path = Some(PathBuf::from(value));
            }
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("PSYNC_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("psync/config.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    env::var("HOME")
        .map(|home| PathBuf::from(home).join(".config"))
        .unwrap_or_else(|_| PathBuf::from(".config"))
}
