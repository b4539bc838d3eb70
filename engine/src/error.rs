//! Error types for the fieldsync engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DeviceId, PeriodId, RecordId, TenantId, Version};

/// All possible errors from the fieldsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("missing identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid version {version} for record {record_id}: versions start at 1")]
    InvalidVersion { record_id: RecordId, version: Version },

    // Outbox errors
    #[error("record {record_id} version {got} does not advance past {last}")]
    VersionNotMonotonic {
        record_id: RecordId,
        last: Version,
        got: Version,
    },

    #[error("device mismatch: outbox belongs to '{expected}', record captured on '{actual}'")]
    DeviceMismatch {
        expected: DeviceId,
        actual: DeviceId,
    },

    #[error("tenant mismatch for record {record_id}: expected '{expected}', got '{actual}'")]
    TenantMismatch {
        record_id: RecordId,
        expected: TenantId,
        actual: TenantId,
    },

    #[error("no outbox entry for record {record_id} version {version}")]
    EntryNotFound {
        record_id: RecordId,
        version: Version,
    },

    #[error("entry {record_id} version {version} is not {expected}")]
    UnexpectedState {
        record_id: RecordId,
        version: Version,
        expected: &'static str,
    },

    // Snapshot errors
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, Error>;

/// Why the authoritative store refused to fold a submission in.
///
/// Rejection reasons travel back to the originating device and stay attached
/// to the parked outbox entry until an operator resolves it.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RejectReason {
    /// Another device owns this record id; the earliest server arrival keeps it.
    #[error("record is owned by device '{owner_device}'")]
    #[serde(rename_all = "camelCase")]
    ConflictingOwner { owner_device: DeviceId },

    /// The reconciliation period no longer accepts submissions.
    #[error("period '{period_id}' is closed")]
    #[serde(rename_all = "camelCase")]
    PeriodClosed { period_id: PeriodId },

    /// A newer version of this record has already been applied.
    #[error("superseded by already-applied version {applied_version}")]
    #[serde(rename_all = "camelCase")]
    SupersededBy { applied_version: Version },

    /// The record id is bound to a different tenant.
    #[error("record id is bound to another tenant")]
    TenantMismatch,

    /// The payload failed validation at the store boundary.
    #[error("invalid payload: {detail}")]
    #[serde(rename_all = "camelCase")]
    Invalid { detail: String },

    /// The upload retry budget for this entry ran out.
    #[error("gave up after {attempts} attempts")]
    #[serde(rename_all = "camelCase")]
    RetriesExhausted { attempts: u32 },
}
