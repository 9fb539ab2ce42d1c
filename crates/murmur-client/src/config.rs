//! Client configuration.
//!
//! Defaults are usable as-is; [`ClientConfig::from_env`] overrides the few
//! settings a deployment usually changes.

use std::path::PathBuf;
use std::time::Duration;

use murmur_net::LeaseConfig;
use murmur_store::WalConfig;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory holding `murmur.db`. `None` uses the platform data dir.
    /// Env: `MURMUR_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Base URL of the admission service.
    /// Env: `MURMUR_ADMISSION_URL`
    /// Default: `http://127.0.0.1:8080`
    pub admission_url: String,

    /// Expiry applied to new messages when the channel has no override.
    /// `None` keeps messages forever.
    /// Env: `MURMUR_DEFAULT_EXPIRY_HOURS` (`0` = never)
    pub default_expiry_hours: Option<u32>,

    /// Name of the same-device broadcast channel.
    pub relay_channel: String,

    /// Remote typing indicators lapse after this long without a refresh.
    pub typing_timeout: Duration,

    /// How often expired messages are swept from the store.
    pub expiry_sweep_interval: Duration,

    /// Number of messages returned by a history read when no limit is given.
    pub history_page: u32,

    pub lease: LeaseConfig,
    pub wal: WalConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            admission_url: "http://127.0.0.1:8080".to_string(),
            default_expiry_hours: None,
            relay_channel: "murmur".to_string(),
            typing_timeout: Duration::from_secs(5),
            expiry_sweep_interval: Duration::from_secs(60),
            history_page: 50,
            lease: LeaseConfig::default(),
            wal: WalConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("MURMUR_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(url) = lookup("MURMUR_ADMISSION_URL") {
            if url.starts_with("http://") || url.starts_with("https://") {
                config.admission_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid MURMUR_ADMISSION_URL, using default");
            }
        }

        if let Some(val) = lookup("MURMUR_DEFAULT_EXPIRY_HOURS") {
            match val.parse::<u32>() {
                Ok(0) => config.default_expiry_hours = None,
                Ok(hours) => config.default_expiry_hours = Some(hours),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid MURMUR_DEFAULT_EXPIRY_HOURS, using default")
                }
            }
        }

        config
    }

    /// Path of the local database file.
    pub fn database_path(&self) -> Result<PathBuf, ClientError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.join("murmur.db")),
            None => Ok(murmur_store::database::default_path()?),
        }
    }

    /// Absolute expiry for a message created at `created_at`, given the
    /// channel's override. `Some(0)` on the channel means never.
    pub fn expires_at(&self, created_at: i64, channel_hours: Option<u32>) -> Option<i64> {
        let hours = match channel_hours {
            Some(0) => return None,
            Some(h) => h,
            None => self.default_expiry_hours?,
        };
        Some(created_at + i64::from(hours) * 3_600_000)
    }
}
