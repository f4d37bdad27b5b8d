use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which persistence backend a server runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Memory,
    Durable,
}

/// Process-wide configuration. Every knob has an environment variable
/// (`GAMETABLE_<NAME>` upper-cased) and a default; the binary's CLI
/// flags override host/port/storage on top of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Max AI wall-clock per move, milliseconds.
    pub think_timeout_ms: u64,
    /// Auto-capture a checkpoint every N successful actions.
    pub checkpoint_interval: usize,
    /// Keep the K most recent checkpoints.
    pub checkpoint_window: usize,
    /// Close connections silent for this many seconds.
    pub connection_idle_s: u64,
    /// Drop matchmaking queue entries older than this many seconds.
    pub matchmaking_ttl_s: u64,
    /// Evict idle sessions from the durable store after this many seconds.
    pub session_ttl_s: u64,
    pub storage_backend: StorageBackendKind,
    /// Required when `storage_backend` is `durable`.
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            think_timeout_ms: 10_000,
            checkpoint_interval: 10,
            checkpoint_window: 5,
            connection_idle_s: 60,
            matchmaking_ttl_s: 300,
            session_ttl_s: 1_800,
            storage_backend: StorageBackendKind::Memory,
            storage_path: None,
        }
    }
}

impl ServerSettings {
    /// Load from environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        if let Some(v) = env_u64("GAMETABLE_THINK_TIMEOUT_MS")? {
            settings.think_timeout_ms = v;
        }
        if let Some(v) = env_u64("GAMETABLE_CHECKPOINT_INTERVAL")? {
            settings.checkpoint_interval = v as usize;
        }
        if let Some(v) = env_u64("GAMETABLE_CHECKPOINT_WINDOW")? {
            settings.checkpoint_window = v as usize;
        }
        if let Some(v) = env_u64("GAMETABLE_CONNECTION_IDLE_S")? {
            settings.connection_idle_s = v;
        }
        if let Some(v) = env_u64("GAMETABLE_MATCHMAKING_TTL_S")? {
            settings.matchmaking_ttl_s = v;
        }
        if let Some(v) = env_u64("GAMETABLE_SESSION_TTL_S")? {
            settings.session_ttl_s = v;
        }
        if let Ok(raw) = std::env::var("GAMETABLE_STORAGE_BACKEND") {
            settings.storage_backend = match raw.as_str() {
                "memory" => StorageBackendKind::Memory,
                "durable" => StorageBackendKind::Durable,
                other => {
                    return Err(SettingsError::InvalidValue(format!(
                        "GAMETABLE_STORAGE_BACKEND must be `memory` or `durable`, got `{other}`"
                    )))
                }
            };
        }
        if let Ok(raw) = std::env::var("GAMETABLE_STORAGE_PATH") {
            settings.storage_path = Some(PathBuf::from(raw));
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.checkpoint_interval == 0 {
            return Err(SettingsError::InvalidValue(
                "checkpoint_interval must be greater than 0".to_string(),
            ));
        }
        if self.checkpoint_window == 0 {
            return Err(SettingsError::InvalidValue(
                "checkpoint_window must be greater than 0".to_string(),
            ));
        }
        if self.think_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "think_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.storage_backend == StorageBackendKind::Durable && self.storage_path.is_none() {
            return Err(SettingsError::InvalidValue(
                "storage_path is required for the durable backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn think_timeout(&self) -> Duration {
        Duration::from_millis(self.think_timeout_ms)
    }

    pub fn connection_idle(&self) -> Duration {
        Duration::from_secs(self.connection_idle_s)
    }

    pub fn matchmaking_ttl(&self) -> Duration {
        Duration::from_secs(self.matchmaking_ttl_s)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_s)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, SettingsError> {
    match std::env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SettingsError::InvalidValue(format!("{key} must be a number, got `{raw}`"))),
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid settings value: {0}")]
    InvalidValue(String),
}
