//! Device-local view of authoritative state.
//!
//! The download phase folds pulled server records into this cache so the
//! device sees merges contributed by other devices. It is a plain
//! last-writer-wins mirror keyed by `server_version`; conflict policy lives
//! on the server side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::ServerRecord;
use crate::RecordId;

/// Mirror of server records on the device, updated by download passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadCache {
    records: BTreeMap<RecordId, ServerRecord>,
    /// Last change-stream position folded in
    cursor: u64,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a pulled record in; returns false when the cached copy is newer.
    pub fn apply(&mut self, record: ServerRecord) -> bool {
        match self.records.get(&record.record_id) {
            Some(existing) if existing.server_version >= record.server_version => false,
            _ => {
                self.records.insert(record.record_id.clone(), record);
                true
            }
        }
    }

    /// Advance the change-stream cursor; it never moves backwards.
    pub fn advance_cursor(&mut self, cursor: u64) {
        if cursor > self.cursor {
            self.cursor = cursor;
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn get(&self, record_id: &str) -> Option<&ServerRecord> {
        self.records.get(record_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ServerRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
