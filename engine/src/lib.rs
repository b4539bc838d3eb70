//! # Fieldsync Engine
//!
//! A deterministic, offline-first synchronization engine for field operations
//! data: GPS-tagged outlet visits, stock movements, and cash reconciliations
//! captured on disconnected devices and reconciled into a tenant-scoped
//! authoritative store.
//!
//! ## Design Principles
//!
//! - **No IO**: The engine performs no network or disk operations. All IO is
//!   handled by the embedding application (device shell or sync server).
//! - **Deterministic**: Given the same inputs, the engine always produces the
//!   same outputs. Clocks are passed in, never read.
//! - **Testable**: Pure functions and explicit state make property-based
//!   testing straightforward.
//! - **Portable**: No async runtime or platform dependencies; the same crate
//!   runs on the device and inside the server.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`SyncableRecord`] is one unit of captured field data. Its payload is a
//! tagged union ([`RecordPayload`]) over the three entity kinds, and its
//! `version` increases by one for every local edit. The server-side
//! counterpart is a [`ServerRecord`], which carries the merge history used
//! for idempotent replay.
//!
//! ### Outbox
//!
//! The [`Outbox`] is the device-local durable queue of not-yet-acknowledged
//! records. Entries move through an explicit state machine
//! (`Pending -> InFlight -> Acknowledged | Rejected`); acknowledged entries
//! are pruned, rejected ones stay visible until an operator resolves them.
//!
//! ### Identity and Merge
//!
//! [`resolve`] classifies an incoming submission against existing server
//! state as new, duplicate, or superseded. [`merge`] then applies the
//! per-kind conflict policy: last-write-wins for visits and cash
//! reconciliations, additive deltas for stock movements.
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldsync_engine::{
//!     merge, resolve, MergeOutcome, MergePolicy, Outbox, RecordPayload, SyncableRecord,
//!     ValidationLimits,
//! };
//!
//! // Capture a visit on the device.
//! let record = SyncableRecord::new(
//!     "visit_0391",
//!     "tenant_acme",
//!     "device_7",
//!     1_706_745_600_000,
//!     RecordPayload::Visit {
//!         outlet_id: "outlet_12".to_string(),
//!         latitude: 40.4093,
//!         longitude: 49.8671,
//!         accuracy_m: 8.0,
//!     },
//! );
//!
//! // Validate and queue it for upload.
//! let mut outbox = Outbox::new("device_7", "tenant_acme");
//! let report = outbox.submit(record.clone(), &ValidationLimits::default(), 1_706_745_600_000)?;
//! assert!(report.is_clean());
//! assert_eq!(outbox.pending_count(), 1);
//!
//! // Server side: resolve identity, then merge into the store.
//! let resolution = resolve(&record, None);
//! let outcome = merge(&record, None, resolution, &MergePolicy::default(), 1_706_745_660_000);
//! assert!(matches!(outcome, MergeOutcome::Applied { .. }));
//! # Ok::<(), fieldsync_engine::Error>(())
//! ```
//!
//! ## Persistence
//!
//! The engine owns no storage. [`OutboxSnapshot`] is the durable form of an
//! outbox: export it after every mutation, import it on process start, and
//! crash recovery falls out of the in-flight timeout.

pub mod cache;
pub mod error;
pub mod merge;
pub mod outbox;
pub mod record;
pub mod resolve;
pub mod snapshot;
pub mod validate;

// Re-export main types at crate root
pub use cache::ReadCache;
pub use error::{Error, RejectReason, Result};
pub use merge::{merge, LedgerDelta, MergeOutcome, MergePolicy, StockLedger};
pub use outbox::{EntryKey, Outbox, OutboxEntry, SyncState, DEFAULT_IN_FLIGHT_TIMEOUT_MS};
pub use record::{MergeEntry, PushAck, RecordPayload, ServerRecord, StockUnit, SyncableRecord};
pub use resolve::{resolve, Resolution};
pub use snapshot::{OutboxSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use validate::{validate, ValidationFlag, ValidationLimits, ValidationReport};

/// Type aliases for clarity
pub type RecordId = String;
pub type TenantId = String;
pub type DeviceId = String;
pub type PeriodId = String;
pub type Version = u64;
pub type Timestamp = u64;
