//! Durable serialized form of the outbox.
//!
//! The embedding application persists snapshots (file, SQLite blob, key-value
//! store) and hands them back on process start. The format carries an
//! explicit version so older builds refuse snapshots from newer ones instead
//! of misreading them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::outbox::{OutboxEntry, SyncState};
use crate::{DeviceId, RecordId, TenantId, Version};

/// Current snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Complete serializable state of an outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxSnapshot {
    /// Format version for forward-compatibility checks
    pub format_version: u32,
    /// Device that owns the snapshotted outbox
    pub device_id: DeviceId,
    /// Tenant the device belongs to
    pub tenant_id: TenantId,
    /// Next enqueue sequence number
    pub next_seq: u64,
    /// In-flight timeout carried with the queue
    pub in_flight_timeout_ms: u64,
    /// Entries by enqueue sequence (BTreeMap for deterministic output)
    pub entries: BTreeMap<u64, OutboxEntry>,
    /// Highest enqueued version per record
    pub versions: BTreeMap<RecordId, Version>,
}

impl OutboxSnapshot {
    /// Serialize to a compact JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::CorruptSnapshot(e.to_string()))
    }

    /// Serialize to pretty-printed JSON, mainly for debugging.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::CorruptSnapshot(e.to_string()))
    }

    /// Parse a snapshot, refusing formats newer than this build understands.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: OutboxSnapshot =
            serde_json::from_str(json).map_err(|e| Error::CorruptSnapshot(e.to_string()))?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::CorruptSnapshot(format!(
                "unsupported format version {} (this build understands up to {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(snapshot)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Summary of a snapshot without its entries, for quick inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub entry_count: usize,
    pub pending_count: usize,
    pub in_flight_count: usize,
    pub rejected_count: usize,
}

impl From<&OutboxSnapshot> for SnapshotMetadata {
    fn from(snapshot: &OutboxSnapshot) -> Self {
        let count = |state: SyncState| {
            snapshot
                .entries
                .values()
                .filter(|e| e.sync_state == state)
                .count()
        };
        Self {
            format_version: snapshot.format_version,
            device_id: snapshot.device_id.clone(),
            tenant_id: snapshot.tenant_id.clone(),
            entry_count: snapshot.entries.len(),
            pending_count: count(SyncState::Pending),
            in_flight_count: count(SyncState::InFlight),
            rejected_count: count(SyncState::Rejected),
        }
    }
}
