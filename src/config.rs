use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::AppError;

pub const ENV_DB: &str = "ROUTINELY_DB";
pub const ENV_DB_MAX_CONNECTIONS: &str = "ROUTINELY_DB_MAX_CONNECTIONS";
pub const ENV_STORE_TIMEOUT_MS: &str = "ROUTINELY_STORE_TIMEOUT_MS";
pub const ENV_ALLOW_NEGATIVE_ADJUSTMENTS: &str = "ROUTINELY_ALLOW_NEGATIVE_ADJUSTMENTS";
pub const ENV_SWEEP_BATCH: &str = "ROUTINELY_SWEEP_BATCH";
pub const ENV_LOG: &str = "ROUTINELY_LOG";
pub const ENV_LOG_DIR: &str = "ROUTINELY_LOG_DIR";

const DEFAULT_LOG_FILTER: &str = "routinely=info,sqlx=warn";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    NotPositiveInteger { key: &'static str, value: String },
    #[error("{key} must be true/false/1/0, got {value:?}")]
    NotBoolean { key: &'static str, value: String },
    #[error("no database path configured and no data directory available")]
    NoDataDir,
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        let key = match &err {
            ConfigError::NotPositiveInteger { key, .. } | ConfigError::NotBoolean { key, .. } => {
                *key
            }
            ConfigError::NoDataDir => ENV_DB,
        };
        AppError::new("VALIDATION/CONFIG", err.to_string()).with_context("field", key)
    }
}

/// Ledger rules that are a policy decision rather than an invariant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerPolicy {
    /// Lets `manual_adjustment` rows take a balance below zero.
    pub allow_negative_manual_adjustments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub db_path: PathBuf,
    pub max_connections: u32,
    pub store_timeout: Duration,
    pub policy: LedgerPolicy,
    pub sweep_batch: u32,
    pub log: LogConfig,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let db_path = match read(ENV_DB) {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let max_connections = match read(ENV_DB_MAX_CONNECTIONS) {
            Some(raw) => parse_positive(ENV_DB_MAX_CONNECTIONS, &raw)?,
            None => 8,
        };
        let store_timeout_ms = match read(ENV_STORE_TIMEOUT_MS) {
            Some(raw) => parse_positive(ENV_STORE_TIMEOUT_MS, &raw)?,
            None => 5_000,
        };
        let allow_negative = match read(ENV_ALLOW_NEGATIVE_ADJUSTMENTS) {
            Some(raw) => parse_bool(ENV_ALLOW_NEGATIVE_ADJUSTMENTS, &raw)?,
            None => false,
        };
        let sweep_batch = match read(ENV_SWEEP_BATCH) {
            Some(raw) => parse_positive(ENV_SWEEP_BATCH, &raw)?,
            None => 100,
        };

        let log = LogConfig {
            filter: read(ENV_LOG)
                .or_else(|| read("RUST_LOG"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            dir: read(ENV_LOG_DIR).map(PathBuf::from),
        };

        Ok(Self {
            db_path,
            max_connections,
            store_timeout: Duration::from_millis(u64::from(store_timeout_ms)),
            policy: LedgerPolicy {
                allow_negative_manual_adjustments: allow_negative,
            },
            sweep_batch,
            log,
        })
    }
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
    Ok(base.join("routinely").join("routinely.sqlite3"))
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::NotPositiveInteger {
            key,
            value: raw.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::NotBoolean {
            key,
            value: raw.to_string(),
        }),
    }
}
