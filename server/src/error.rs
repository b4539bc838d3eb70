//! Unified error handling for the sync service.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Service-level error type.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("engine error: {0}")]
    Engine(#[from] fieldsync_engine::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("stored state unreadable: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ServiceError {
    /// Whether retrying later could reasonably succeed.
    ///
    /// Corruption and configuration problems are never transient; they need
    /// operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            ServiceError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias using the service error.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ServiceError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(ServiceError::Transport(TransportError::transient("socket reset")).is_transient());
        assert!(!ServiceError::Transport(TransportError::fatal("bad session")).is_transient());
        assert!(!ServiceError::Corrupt("truncated payload".to_string()).is_transient());
    }

    #[test]
    fn engine_errors_convert() {
        let engine_err = fieldsync_engine::Error::MissingIdentifier("recordId");
        let err: ServiceError = engine_err.into();
        assert_eq!(err.to_string(), "engine error: missing identifier: recordId");
        assert!(!err.is_transient());
    }
}
