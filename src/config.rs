use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// PostgreSQL connection URL, required when `ledger.backend` is `postgres`
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// Longest a transfer waits for an account lock before failing with `Busy`
    pub lock_timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            lock_timeout_ms: 5000,
            max_connections: 50,
        }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: config_path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ledger.lock_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.ledger.backend == LedgerBackend::Postgres && self.postgres_url.is_none() {
            return Err(ConfigError::Invalid(
                "postgres_url is required for the postgres ledger backend".into(),
            ));
        }
        Ok(())
    }
}
