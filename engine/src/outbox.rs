//! Device-local durable queue of not-yet-acknowledged records.
//!
//! Every entry moves through an explicit state machine:
//!
//! ```text
//! Pending -> InFlight -> Acknowledged (pruned)
//!                     -> Rejected    (parked until an operator resolves it)
//!                     -> Pending     (released, or in-flight timeout)
//! ```
//!
//! The outbox is exclusively owned by its device. Entries for the same
//! record drain in ascending version order; a record with an in-flight
//! entry has its later versions withheld until that entry settles.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, RejectReason, Result};
use crate::record::SyncableRecord;
use crate::snapshot::{OutboxSnapshot, SNAPSHOT_FORMAT_VERSION};
use crate::validate::{validate, ValidationLimits, ValidationReport};
use crate::{DeviceId, RecordId, TenantId, Timestamp, Version};

/// How long a claimed entry may stay in flight before it is considered
/// failed and offered for retry, in milliseconds.
pub const DEFAULT_IN_FLIGHT_TIMEOUT_MS: u64 = 30_000;

/// Key identifying one queued submission.
pub type EntryKey = (RecordId, Version);

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Waiting for a sync pass to claim it
    Pending,
    /// Claimed by a running sync pass
    InFlight,
    /// Confirmed by the server; entries in this state are pruned immediately
    Acknowledged,
    /// Refused by the server; kept visible until explicitly discarded
    Rejected,
}

/// A queued submission wrapped with its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Device-local enqueue sequence; drain order follows it
    pub seq: u64,
    pub record: SyncableRecord,
    pub sync_state: SyncState,
    /// Upload attempts so far; incremented each time the entry is claimed
    pub attempt_count: u32,
    /// Device clock when the record was enqueued (milliseconds since epoch)
    pub queued_at: Timestamp,
    /// Device clock at the last claim, absent before the first attempt
    pub last_attempt_at: Option<Timestamp>,
    /// Why the server refused it, for entries in `Rejected`
    pub reject_reason: Option<RejectReason>,
}

impl OutboxEntry {
    pub fn key(&self) -> EntryKey {
        (self.record.record_id.clone(), self.record.version)
    }
}

/// The device-local submission queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbox {
    device_id: DeviceId,
    tenant_id: TenantId,
    next_seq: u64,
    in_flight_timeout_ms: u64,
    /// Entries by enqueue sequence; iteration order is drain order
    entries: BTreeMap<u64, OutboxEntry>,
    /// Highest version ever enqueued per record, kept after pruning
    versions: BTreeMap<RecordId, Version>,
}

impl Outbox {
    /// Create an empty outbox owned by one device within one tenant.
    pub fn new(device_id: impl Into<DeviceId>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            device_id: device_id.into(),
            tenant_id: tenant_id.into(),
            next_seq: 1,
            in_flight_timeout_ms: DEFAULT_IN_FLIGHT_TIMEOUT_MS,
            entries: BTreeMap::new(),
            versions: BTreeMap::new(),
        }
    }

    /// Override the in-flight timeout.
    pub fn with_in_flight_timeout(mut self, timeout_ms: u64) -> Self {
        self.in_flight_timeout_ms = timeout_ms;
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn in_flight_timeout_ms(&self) -> u64 {
        self.in_flight_timeout_ms
    }

    /// Validate a captured record and enqueue it for upload.
    ///
    /// This is the capture layer's entry point: a record that fails
    /// validation never enters the queue.
    pub fn submit(
        &mut self,
        record: SyncableRecord,
        limits: &ValidationLimits,
        now: Timestamp,
    ) -> Result<ValidationReport> {
        let report = validate(&record, limits)?;
        self.enqueue(record, now)?;
        Ok(report)
    }

    /// Enqueue an already-validated record; returns its sequence number.
    pub fn enqueue(&mut self, record: SyncableRecord, now: Timestamp) -> Result<u64> {
        if record.device_id != self.device_id {
            return Err(Error::DeviceMismatch {
                expected: self.device_id.clone(),
                actual: record.device_id,
            });
        }
        if record.tenant_id != self.tenant_id {
            return Err(Error::TenantMismatch {
                record_id: record.record_id,
                expected: self.tenant_id.clone(),
                actual: record.tenant_id,
            });
        }
        if let Some(&last) = self.versions.get(&record.record_id) {
            if record.version <= last {
                return Err(Error::VersionNotMonotonic {
                    record_id: record.record_id,
                    last,
                    got: record.version,
                });
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.versions
            .insert(record.record_id.clone(), record.version);
        self.entries.insert(
            seq,
            OutboxEntry {
                seq,
                record,
                sync_state: SyncState::Pending,
                attempt_count: 0,
                queued_at: now,
                last_attempt_at: None,
                reject_reason: None,
            },
        );
        Ok(seq)
    }

    /// Oldest-first batch of claimable entries, at most `limit` of them.
    ///
    /// In-flight entries whose claim is older than the timeout revert to
    /// pending first; that is the crash-recovery path. Records that still
    /// have a live in-flight entry are withheld so versions never overtake
    /// each other.
    pub fn list_pending(&mut self, limit: usize, now: Timestamp) -> Vec<OutboxEntry> {
        self.requeue_timed_out(now);

        let in_flight: BTreeSet<RecordId> = self
            .entries
            .values()
            .filter(|e| e.sync_state == SyncState::InFlight)
            .map(|e| e.record.record_id.clone())
            .collect();

        self.entries
            .values()
            .filter(|e| e.sync_state == SyncState::Pending)
            .filter(|e| !in_flight.contains(&e.record.record_id))
            .take(limit)
            .cloned()
            .collect()
    }

    fn requeue_timed_out(&mut self, now: Timestamp) {
        for entry in self.entries.values_mut() {
            if entry.sync_state != SyncState::InFlight {
                continue;
            }
            let timed_out = entry
                .last_attempt_at
                .map_or(true, |at| now.saturating_sub(at) >= self.in_flight_timeout_ms);
            if timed_out {
                entry.sync_state = SyncState::Pending;
            }
        }
    }

    /// Claim pending entries for an upload attempt.
    ///
    /// All-or-nothing: either every key is a pending entry and all of them
    /// move to in-flight with the attempt recorded, or nothing changes.
    pub fn mark_in_flight(&mut self, keys: &[EntryKey], now: Timestamp) -> Result<()> {
        let mut seqs = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = self.entry_for(key)?;
            if entry.sync_state != SyncState::Pending {
                return Err(Error::UnexpectedState {
                    record_id: key.0.clone(),
                    version: key.1,
                    expected: "pending",
                });
            }
            seqs.push(entry.seq);
        }
        for seq in seqs {
            if let Some(entry) = self.entries.get_mut(&seq) {
                entry.sync_state = SyncState::InFlight;
                entry.attempt_count += 1;
                entry.last_attempt_at = Some(now);
            }
        }
        Ok(())
    }

    /// Prune entries the server has confirmed.
    ///
    /// Unknown keys are ignored: with at-least-once delivery an entry may
    /// have been acknowledged and pruned by an earlier pass already.
    pub fn mark_acknowledged(&mut self, keys: &[EntryKey]) {
        self.entries.retain(|_, entry| {
            !keys
                .iter()
                .any(|(id, version)| entry.record.record_id == *id && entry.record.version == *version)
        });
    }

    /// Park an entry the server refused, with the reason attached.
    pub fn mark_rejected(&mut self, key: &EntryKey, reason: RejectReason) -> Result<()> {
        let seq = self.entry_for(key)?.seq;
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.sync_state = SyncState::Rejected;
            entry.reject_reason = Some(reason);
        }
        Ok(())
    }

    /// Return claimed entries to pending, keeping their attempt counts.
    ///
    /// Entries that are not in flight are left alone; a release can race an
    /// acknowledgment during cancellation.
    pub fn release(&mut self, keys: &[EntryKey]) {
        for key in keys {
            let found = self
                .entries
                .values_mut()
                .find(|e| e.record.record_id == key.0 && e.record.version == key.1);
            if let Some(entry) = found {
                if entry.sync_state == SyncState::InFlight {
                    entry.sync_state = SyncState::Pending;
                }
            }
        }
    }

    /// Entries parked for operator resolution, oldest first.
    pub fn rejected(&self) -> Vec<&OutboxEntry> {
        self.entries
            .values()
            .filter(|e| e.sync_state == SyncState::Rejected)
            .collect()
    }

    /// Drop a rejected entry after the operator has resolved it.
    pub fn discard_rejected(&mut self, key: &EntryKey) -> Result<()> {
        let entry = self.entry_for(key)?;
        if entry.sync_state != SyncState::Rejected {
            return Err(Error::UnexpectedState {
                record_id: key.0.clone(),
                version: key.1,
                expected: "rejected",
            });
        }
        let seq = entry.seq;
        self.entries.remove(&seq);
        Ok(())
    }

    pub fn get(&self, key: &EntryKey) -> Option<&OutboxEntry> {
        self.entries
            .values()
            .find(|e| e.record.record_id == key.0 && e.record.version == key.1)
    }

    /// All entries in drain order.
    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.values()
    }

    pub fn pending_count(&self) -> usize {
        self.count_state(SyncState::Pending)
    }

    pub fn in_flight_count(&self) -> usize {
        self.count_state(SyncState::InFlight)
    }

    pub fn rejected_count(&self) -> usize {
        self.count_state(SyncState::Rejected)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn count_state(&self, state: SyncState) -> usize {
        self.entries
            .values()
            .filter(|e| e.sync_state == state)
            .count()
    }

    fn entry_for(&self, key: &EntryKey) -> Result<&OutboxEntry> {
        self.get(key).ok_or_else(|| Error::EntryNotFound {
            record_id: key.0.clone(),
            version: key.1,
        })
    }

    /// Export the full queue state for durable storage.
    pub fn export_snapshot(&self) -> OutboxSnapshot {
        OutboxSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device_id: self.device_id.clone(),
            tenant_id: self.tenant_id.clone(),
            next_seq: self.next_seq,
            in_flight_timeout_ms: self.in_flight_timeout_ms,
            entries: self.entries.clone(),
            versions: self.versions.clone(),
        }
    }

    /// Replace this outbox's state from a snapshot.
    ///
    /// The snapshot must belong to the same device and tenant. In-flight
    /// entries are imported as-is; the in-flight timeout returns them to
    /// pending on the next [`list_pending`](Self::list_pending) call.
    pub fn import_state(&mut self, snapshot: OutboxSnapshot) -> Result<()> {
        if snapshot.device_id != self.device_id {
            return Err(Error::DeviceMismatch {
                expected: self.device_id.clone(),
                actual: snapshot.device_id,
            });
        }
        if snapshot.tenant_id != self.tenant_id {
            return Err(Error::CorruptSnapshot(format!(
                "snapshot belongs to tenant '{}', not '{}'",
                snapshot.tenant_id, self.tenant_id
            )));
        }
        self.next_seq = snapshot.next_seq;
        self.in_flight_timeout_ms = snapshot.in_flight_timeout_ms;
        self.entries = snapshot.entries;
        self.versions = snapshot.versions;
        Ok(())
    }
}
