//! Identity resolution against server-side merge history.
//!
//! Every incoming submission is classified before the conflict policy runs.
//! The classification is what makes at-least-once upload safe: a replayed
//! submission resolves to [`Resolution::Duplicate`] and is acknowledged
//! without touching the store again.

use serde::{Deserialize, Serialize};

use crate::record::{ServerRecord, SyncableRecord};

/// How an incoming submission relates to existing server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Not seen before: either the first submission for this record id, or a
    /// version the store has not folded in yet.
    New,
    /// This exact submission was already folded in; acknowledge without
    /// reapplying.
    Duplicate,
    /// A higher version of this record has already been applied; this is a
    /// late, stale submission.
    Superseded,
}

/// Classify a submission against the current server record, if any.
pub fn resolve(incoming: &SyncableRecord, existing: Option<&ServerRecord>) -> Resolution {
    let Some(server) = existing else {
        return Resolution::New;
    };
    if server.has_merged(incoming.version, &incoming.device_id) {
        return Resolution::Duplicate;
    }
    if incoming.version < server.max_merged_version() {
        return Resolution::Superseded;
    }
    Resolution::New
}
