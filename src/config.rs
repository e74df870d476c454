//! Storage configuration, resolved once at construction.
//!
//! The bot process reads its storage settings from the environment exactly
//! once, when the archive store is built. The resolved [`ArchiveConfig`] is
//! immutable afterwards; the router folds the mode into a fixed dispatch
//! plan, so no call path re-reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

pub const STORAGE_BACKEND: &str = "STORAGE_BACKEND";
pub const ARCHIVE_DB_PATH: &str = "ARCHIVE_DB_PATH";
pub const DB_POOL_SIZE: &str = "DB_POOL_SIZE";
pub const DB_POOL_ACQUIRE_TIMEOUT_MS: &str = "DB_POOL_ACQUIRE_TIMEOUT_MS";
pub const REMOTE_STORE_URL: &str = "REMOTE_STORE_URL";
pub const REMOTE_STORE_SERVICE_KEY: &str = "REMOTE_STORE_SERVICE_KEY";
pub const REMOTE_REQUEST_TIMEOUT_SECS: &str = "REMOTE_REQUEST_TIMEOUT_SECS";
pub const REMOTE_PAGE_SIZE: &str = "REMOTE_PAGE_SIZE";

const DEFAULT_DB_PATH: &str = "data/archive.db";
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_REMOTE_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingVar { key: &'static str },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Which backends this process reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Embedded engine only.
    Embedded,
    /// Remote REST store only; no fallback path exists.
    Remote,
    /// Writes fan out to both; reads prefer remote and fall back to embedded.
    Both,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Embedded => "embedded",
            StorageMode::Remote => "remote",
            StorageMode::Both => "both",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "embedded" => Some(StorageMode::Embedded),
            "remote" => Some(StorageMode::Remote),
            "both" => Some(StorageMode::Both),
            _ => None,
        }
    }

    pub fn uses_embedded(&self) -> bool {
        matches!(self, StorageMode::Embedded | StorageMode::Both)
    }

    pub fn uses_remote(&self) -> bool {
        matches!(self, StorageMode::Remote | StorageMode::Both)
    }
}

/// Sizing for the embedded-engine connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of connections opened at startup.
    pub size: usize,
    /// Bounded wait before `acquire` opens a supernumerary connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
        }
    }
}

/// Endpoint and credentials for the remote REST store.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: Url,
    pub service_key: SecretString,
    pub request_timeout: Duration,
    /// Rows fetched per page while the translator walks a result set.
    pub page_size: usize,
}

/// Fully resolved storage settings.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub mode: StorageMode,
    pub db_path: PathBuf,
    pub pool: PoolConfig,
    pub remote: Option<RemoteConfig>,
}

impl ArchiveConfig {
    /// Resolve from the process environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::resolve_from(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary lookup. `from_env` delegates here; tests
    /// pass a map so they never mutate process-wide state.
    pub fn resolve_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mode = match lookup(STORAGE_BACKEND) {
            Some(raw) => StorageMode::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: STORAGE_BACKEND,
                message: format!("expected embedded, remote, or both, got '{}'", raw.trim()),
            })?,
            None => StorageMode::Embedded,
        };

        let db_path = lookup(ARCHIVE_DB_PATH)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let size = parse_integer(&lookup, DB_POOL_SIZE, DEFAULT_POOL_SIZE as u64)? as usize;
        if size == 0 {
            return Err(ConfigError::InvalidValue {
                key: DB_POOL_SIZE,
                message: "pool size must be at least 1".to_string(),
            });
        }
        let acquire_ms = parse_integer(&lookup, DB_POOL_ACQUIRE_TIMEOUT_MS, DEFAULT_ACQUIRE_TIMEOUT_MS)?;
        let request_secs = parse_integer(&lookup, REMOTE_REQUEST_TIMEOUT_SECS, DEFAULT_REMOTE_TIMEOUT_SECS)?;
        let page_size = parse_integer(&lookup, REMOTE_PAGE_SIZE, DEFAULT_REMOTE_PAGE_SIZE as u64)? as usize;
        if page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: REMOTE_PAGE_SIZE,
                message: "page size must be at least 1".to_string(),
            });
        }

        let remote = if mode.uses_remote() {
            let raw_url = lookup(REMOTE_STORE_URL)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingVar { key: REMOTE_STORE_URL })?;
            let raw_key = lookup(REMOTE_STORE_SERVICE_KEY)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingVar { key: REMOTE_STORE_SERVICE_KEY })?;
            let url = Url::parse(raw_url.trim()).map_err(|e| ConfigError::InvalidValue {
                key: REMOTE_STORE_URL,
                message: e.to_string(),
            })?;
            Some(RemoteConfig {
                url,
                service_key: SecretString::from(raw_key),
                request_timeout: Duration::from_secs(request_secs),
                page_size,
            })
        } else {
            None
        };

        Ok(Self {
            mode,
            db_path,
            pool: PoolConfig {
                size,
                acquire_timeout: Duration::from_millis(acquire_ms),
            },
            remote,
        })
    }
}

fn parse_integer(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            key,
            message: format!("expected an integer, got '{}'", raw.trim()),
        }),
        None => Ok(default),
    }
}
