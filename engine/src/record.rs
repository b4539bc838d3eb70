//! Record types shared by devices and the authoritative store.

use serde::{Deserialize, Serialize};

use crate::error::RejectReason;
use crate::{DeviceId, PeriodId, RecordId, TenantId, Timestamp, Version};

/// Unit of measure for stock movements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockUnit {
    Each,
    Case,
    Kilogram,
    Litre,
}

/// Payload carried by a syncable record, one variant per entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RecordPayload {
    /// A GPS-tagged outlet visit.
    #[serde(rename_all = "camelCase")]
    Visit {
        /// Outlet the agent checked in at
        outlet_id: String,
        /// Latitude in decimal degrees
        latitude: f64,
        /// Longitude in decimal degrees
        longitude: f64,
        /// Reported GPS accuracy radius in meters
        accuracy_m: f64,
    },
    /// An additive stock delta against a warehouse/product pair.
    #[serde(rename_all = "camelCase")]
    StockMovement {
        warehouse_id: String,
        product_id: String,
        /// Signed quantity change; negative for outbound stock
        quantity_delta: f64,
        unit: StockUnit,
    },
    /// An end-of-period cash count, in minor currency units.
    #[serde(rename_all = "camelCase")]
    CashReconciliation {
        /// Reconciliation period this count belongs to
        period_id: PeriodId,
        /// Cash counted by the agent
        counted_minor: i64,
        /// Cash expected from sales records
        expected_minor: i64,
        /// ISO 4217 currency code
        currency: String,
    },
}

impl RecordPayload {
    /// Wire name of the payload variant, used in logs and rejection details.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordPayload::Visit { .. } => "visit",
            RecordPayload::StockMovement { .. } => "stockMovement",
            RecordPayload::CashReconciliation { .. } => "cashReconciliation",
        }
    }
}

/// A record captured on a device, as shipped to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    /// Client-generated identifier, stable across retries
    pub record_id: RecordId,
    /// Tenant this record belongs to
    pub tenant_id: TenantId,
    /// Device that captured it
    pub device_id: DeviceId,
    /// Device clock at capture time (milliseconds since epoch)
    pub created_at_device: Timestamp,
    /// Per-record version, increases by one on every local edit
    pub version: Version,
    /// Entity payload
    pub payload: RecordPayload,
}

impl SyncableRecord {
    /// Create a first-version record as captured on a device.
    pub fn new(
        record_id: impl Into<RecordId>,
        tenant_id: impl Into<TenantId>,
        device_id: impl Into<DeviceId>,
        created_at_device: Timestamp,
        payload: RecordPayload,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            created_at_device,
            version: 1,
            payload,
        }
    }

    /// Produce the next local edit of this record.
    pub fn next_version(&self, payload: RecordPayload, created_at_device: Timestamp) -> Self {
        Self {
            record_id: self.record_id.clone(),
            tenant_id: self.tenant_id.clone(),
            device_id: self.device_id.clone(),
            created_at_device,
            version: self.version + 1,
            payload,
        }
    }
}

/// One client submission folded into a server record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeEntry {
    pub record_id: RecordId,
    pub version: Version,
    /// Device that contributed this submission
    pub device_id: DeviceId,
    /// Server clock when the submission was applied (milliseconds since epoch)
    pub applied_at: Timestamp,
}

/// The authoritative, server-side counterpart of a syncable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub record_id: RecordId,
    /// Tenant binding, fixed at first acceptance
    pub tenant_id: TenantId,
    /// Device that captured the currently winning state
    pub device_id: DeviceId,
    pub created_at_device: Timestamp,
    /// Client version of the winning state
    pub version: Version,
    pub payload: RecordPayload,
    /// Server clock at first acceptance (milliseconds since epoch)
    pub server_received_at: Timestamp,
    /// Server-assigned version, incremented on every accepted fold
    pub server_version: Version,
    /// Submissions already folded in, in application order
    pub merge_history: Vec<MergeEntry>,
}

impl ServerRecord {
    /// Create the authoritative record for a first-time submission.
    pub fn first(incoming: &SyncableRecord, now_server: Timestamp) -> Self {
        Self {
            record_id: incoming.record_id.clone(),
            tenant_id: incoming.tenant_id.clone(),
            device_id: incoming.device_id.clone(),
            created_at_device: incoming.created_at_device,
            version: incoming.version,
            payload: incoming.payload.clone(),
            server_received_at: now_server,
            server_version: 1,
            merge_history: vec![MergeEntry {
                record_id: incoming.record_id.clone(),
                version: incoming.version,
                device_id: incoming.device_id.clone(),
                applied_at: now_server,
            }],
        }
    }

    /// Whether this exact submission has already been folded in.
    ///
    /// Matching includes the device so that a replayed upload is recognized
    /// while an equal-version submission from another device still reaches
    /// the conflict policy.
    pub fn has_merged(&self, version: Version, device_id: &str) -> bool {
        self.merge_history
            .iter()
            .any(|entry| entry.version == version && entry.device_id == device_id)
    }

    /// Highest client version folded in so far.
    pub fn max_merged_version(&self) -> Version {
        self.merge_history
            .iter()
            .map(|entry| entry.version)
            .max()
            .unwrap_or(self.version)
    }
}

/// Per-record acknowledgment returned by the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PushAck {
    /// Applied; the server record now carries this client version.
    #[serde(rename_all = "camelCase")]
    Accepted {
        record_id: RecordId,
        version: Version,
        server_version: Version,
    },
    /// Already folded in earlier; safe to prune from the outbox.
    #[serde(rename_all = "camelCase")]
    Duplicate {
        record_id: RecordId,
        version: Version,
        server_version: Version,
    },
    /// Refused; the device keeps the entry for manual resolution.
    #[serde(rename_all = "camelCase")]
    Rejected {
        record_id: RecordId,
        version: Version,
        reason: RejectReason,
    },
}

impl PushAck {
    pub fn record_id(&self) -> &RecordId {
        match self {
            PushAck::Accepted { record_id, .. } => record_id,
            PushAck::Duplicate { record_id, .. } => record_id,
            PushAck::Rejected { record_id, .. } => record_id,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            PushAck::Accepted { version, .. } => *version,
            PushAck::Duplicate { version, .. } => *version,
            PushAck::Rejected { version, .. } => *version,
        }
    }
}
