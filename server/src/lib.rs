//! Fieldsync server core: the tenant-scoped authoritative store and the
//! sync coordination that drains device outboxes into it.
//!
//! The crate is embeddable: an HTTP or gRPC edge owns routing and
//! authentication and calls into [`AuthoritativeStore`] for push/pull, or
//! hosts device sessions directly through [`SyncCoordinator`] over a
//! [`SyncTransport`]. Persistence is pluggable behind [`StoreBackend`];
//! [`PgBackend`] is the production implementation and [`MemoryBackend`]
//! backs tests and single-process deployments.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{Config, ConfigError, SyncSettings, TenantPolicy};
pub use coordinator::{PassSummary, SessionPhase, SyncCoordinator};
pub use error::{Result, ServiceError};
pub use session::{RejectionNotice, SyncSession};
pub use store::{
    AuthoritativeStore, ChangeEntry, MemoryBackend, PgBackend, Pool, PullPage, StoreBackend,
};
pub use transport::{InProcessTransport, SyncTransport, TransportError};

/// Milliseconds since the Unix epoch on the server clock.
pub(crate) fn now_ms() -> fieldsync_engine::Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
