//! Configuration for the sync service.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use fieldsync_engine::{MergePolicy, PeriodId, ValidationLimits};
use thiserror::Error;

use crate::store::DEFAULT_PULL_LIMIT;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_PARALLELISM: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_MS: u64 = 5_000;
pub const DEFAULT_RETRY_CAP_MS: u64 = 300_000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Connection pool size for the PostgreSQL backend
    pub max_connections: u32,
    /// Sync pass tuning
    pub sync: SyncSettings,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first
    /// when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;
        let max_connections = parse_env("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;

        let sync = SyncSettings {
            batch_size: parse_env("SYNC_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            parallelism: parse_env("SYNC_PARALLELISM", DEFAULT_PARALLELISM)?,
            max_attempts: parse_env("SYNC_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry_base: Duration::from_millis(parse_env(
                "SYNC_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE_MS,
            )?),
            retry_cap: Duration::from_millis(parse_env(
                "SYNC_RETRY_CAP_MS",
                DEFAULT_RETRY_CAP_MS,
            )?),
            pull_limit: parse_env("SYNC_PULL_LIMIT", DEFAULT_PULL_LIMIT)?,
        };

        Ok(Self {
            database_url,
            max_connections,
            sync,
        })
    }
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Tuning for upload and download passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Entries claimed from an outbox per upload iteration
    pub batch_size: usize,
    /// Concurrent record streams committed in parallel
    pub parallelism: usize,
    /// Upload attempts per entry before it is parked as rejected
    pub max_attempts: u32,
    /// First retry delay; doubled after each consecutive transient failure
    pub retry_base: Duration,
    /// Upper bound on the retry delay
    pub retry_cap: Duration,
    /// Records fetched per download page
    pub pull_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_cap: Duration::from_millis(DEFAULT_RETRY_CAP_MS),
            pull_limit: DEFAULT_PULL_LIMIT,
        }
    }
}

/// Per-tenant validation and merge rules.
///
/// Tenants without a registered policy get the defaults: a 100 m GPS
/// accuracy ceiling and no closed periods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantPolicy {
    pub limits: ValidationLimits,
    pub merge: MergePolicy,
}

impl TenantPolicy {
    /// Stop accepting cash reconciliations for a period.
    pub fn close_period(&mut self, period_id: impl Into<PeriodId>) {
        self.merge.closed_periods.insert(period_id.into());
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}
