//! Tenant-scoped authoritative store.
//!
//! [`AuthoritativeStore`] owns the submission pipeline: boundary
//! re-validation, identity resolution, conflict merge, and the commit.
//! Writes are serialized per record id while unrelated records commit in
//! parallel; the change log feeds per-device download cursors.

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::{PgBackend, Pool};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fieldsync_engine::{
    merge, resolve, validate, LedgerDelta, MergeOutcome, PushAck, RecordId, RejectReason,
    ServerRecord, SyncableRecord, TenantId,
};

use crate::config::{TenantPolicy, DEFAULT_PARALLELISM};
use crate::error::Result;
use crate::now_ms;

/// Records returned per pull when the caller does not say otherwise.
pub const DEFAULT_PULL_LIMIT: usize = 100;
/// Hard ceiling on records per pull.
pub const MAX_PULL_LIMIT: usize = 1000;

/// One row of a tenant's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Position in the tenant's change stream, strictly increasing
    pub seq: u64,
    pub record_id: RecordId,
}

/// A page of server records newer than a device's cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPage {
    pub records: Vec<ServerRecord>,
    /// Cursor to resume from on the next pull
    pub next_cursor: u64,
    pub has_more: bool,
}

/// Persistence port for the authoritative store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Current server record, with its merge history loaded.
    async fn fetch(&self, tenant_id: &str, record_id: &str) -> Result<Option<ServerRecord>>;

    /// Tenant a record id was first accepted under, if any.
    async fn owner_tenant(&self, record_id: &str) -> Result<Option<TenantId>>;

    /// Durably apply a merged record: upsert it, bind its owner tenant on
    /// first sight, fold the ledger delta in, and append to the change
    /// stream. Returns the appended change sequence.
    async fn commit(&self, record: &ServerRecord, ledger: Option<&LedgerDelta>) -> Result<u64>;

    /// Change rows after `since`, ascending, at most `limit` of them.
    async fn changes_since(
        &self,
        tenant_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>>;

    /// Running stock total for a warehouse/product pair.
    async fn stock_total(
        &self,
        tenant_id: &str,
        warehouse_id: &str,
        product_id: &str,
    ) -> Result<f64>;

    /// Last change sequence a device has confirmed downloading.
    async fn device_cursor(&self, tenant_id: &str, device_id: &str) -> Result<u64>;

    /// Advance a device cursor; it never moves backwards.
    async fn set_device_cursor(&self, tenant_id: &str, device_id: &str, cursor: u64)
        -> Result<()>;
}

/// The server-side system of record.
pub struct AuthoritativeStore {
    backend: Arc<dyn StoreBackend>,
    /// Per-record write locks; unrelated records commit in parallel
    locks: DashMap<RecordId, Arc<Mutex<()>>>,
    policies: DashMap<TenantId, TenantPolicy>,
    parallelism: usize,
}

impl AuthoritativeStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
            policies: DashMap::new(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// Override how many record streams a batch commits concurrently.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Register or replace a tenant's validation and merge policy.
    pub fn set_tenant_policy(&self, tenant_id: impl Into<TenantId>, policy: TenantPolicy) {
        self.policies.insert(tenant_id.into(), policy);
    }

    /// Policy for a tenant, falling back to the defaults.
    pub fn tenant_policy(&self, tenant_id: &str) -> TenantPolicy {
        self.policies
            .get(tenant_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Apply one submission and produce its acknowledgment.
    ///
    /// Business-rule refusals are `Ok(PushAck::Rejected)`; only storage
    /// failures surface as errors.
    pub async fn submit(&self, record: &SyncableRecord) -> Result<PushAck> {
        let policy = self.tenant_policy(&record.tenant_id);

        // Transports are not trusted; re-run capture validation here.
        if let Err(e) = validate(record, &policy.limits) {
            warn!(
                record_id = %record.record_id,
                tenant_id = %record.tenant_id,
                error = %e,
                "submission failed boundary validation"
            );
            return Ok(PushAck::Rejected {
                record_id: record.record_id.clone(),
                version: record.version,
                reason: RejectReason::Invalid {
                    detail: e.to_string(),
                },
            });
        }

        let lock = self.record_lock(&record.record_id);
        let _guard = lock.lock().await;

        // A record id belongs to the tenant that first submitted it.
        if let Some(owner) = self.backend.owner_tenant(&record.record_id).await? {
            if owner != record.tenant_id {
                warn!(
                    record_id = %record.record_id,
                    tenant_id = %record.tenant_id,
                    owner = %owner,
                    "record id is bound to another tenant"
                );
                return Ok(PushAck::Rejected {
                    record_id: record.record_id.clone(),
                    version: record.version,
                    reason: RejectReason::TenantMismatch,
                });
            }
        }

        let current = self
            .backend
            .fetch(&record.tenant_id, &record.record_id)
            .await?;
        let resolution = resolve(record, current.as_ref());

        match merge(record, current.as_ref(), resolution, &policy.merge, now_ms()) {
            MergeOutcome::Applied {
                record: next,
                ledger,
            } => {
                let seq = self.backend.commit(&next, ledger.as_ref()).await?;
                debug!(
                    record_id = %next.record_id,
                    version = next.version,
                    server_version = next.server_version,
                    change_seq = seq,
                    "submission applied"
                );
                Ok(PushAck::Accepted {
                    record_id: next.record_id.clone(),
                    version: record.version,
                    server_version: next.server_version,
                })
            }
            MergeOutcome::Duplicate { server_version } => {
                debug!(
                    record_id = %record.record_id,
                    version = record.version,
                    "duplicate submission acknowledged"
                );
                Ok(PushAck::Duplicate {
                    record_id: record.record_id.clone(),
                    version: record.version,
                    server_version,
                })
            }
            MergeOutcome::Rejected(reason) => {
                warn!(
                    record_id = %record.record_id,
                    version = record.version,
                    reason = %reason,
                    "submission rejected"
                );
                Ok(PushAck::Rejected {
                    record_id: record.record_id.clone(),
                    version: record.version,
                    reason,
                })
            }
        }
    }

    /// Apply a batch, sequential per record id, concurrent across records.
    ///
    /// Acks come back in submission order regardless of which record
    /// streams finish first.
    pub async fn submit_batch(&self, records: Vec<SyncableRecord>) -> Result<Vec<PushAck>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let total = records.len();

        let mut groups: Vec<Vec<(usize, SyncableRecord)>> = Vec::new();
        let mut index: HashMap<RecordId, usize> = HashMap::new();
        for (pos, record) in records.into_iter().enumerate() {
            match index.get(&record.record_id) {
                Some(&at) => groups[at].push((pos, record)),
                None => {
                    index.insert(record.record_id.clone(), groups.len());
                    groups.push(vec![(pos, record)]);
                }
            }
        }

        let placed: Vec<Vec<(usize, PushAck)>> = stream::iter(groups.into_iter().map(
            |group| async move {
                let mut acks = Vec::with_capacity(group.len());
                for (pos, record) in &group {
                    acks.push((*pos, self.submit(record).await?));
                }
                Ok::<_, crate::error::ServiceError>(acks)
            },
        ))
        .buffer_unordered(self.parallelism)
        .try_collect()
        .await?;

        let mut slots: Vec<Option<PushAck>> = Vec::new();
        slots.resize_with(total, || None);
        for (pos, ack) in placed.into_iter().flatten() {
            slots[pos] = Some(ack);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Serve a download page for one device.
    ///
    /// Fetches `limit + 1` change rows to learn whether more exist, keeps
    /// the latest state per record, and advances the device cursor.
    pub async fn pull(
        &self,
        tenant_id: &str,
        device_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<PullPage> {
        let limit = limit.clamp(1, MAX_PULL_LIMIT);
        let mut changes = self
            .backend
            .changes_since(tenant_id, since, limit + 1)
            .await?;
        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let next_cursor = changes.last().map(|c| c.seq).unwrap_or(since);

        // One record may appear several times in a page; fetch it once, in
        // the order of its newest change row.
        let mut latest: BTreeMap<&str, u64> = BTreeMap::new();
        for change in &changes {
            latest.insert(change.record_id.as_str(), change.seq);
        }
        let mut order: Vec<(u64, &str)> = latest.into_iter().map(|(id, seq)| (seq, id)).collect();
        order.sort_unstable();

        let mut records = Vec::with_capacity(order.len());
        for (_, record_id) in order {
            if let Some(record) = self.backend.fetch(tenant_id, record_id).await? {
                records.push(record);
            }
        }

        self.backend
            .set_device_cursor(tenant_id, device_id, next_cursor)
            .await?;
        debug!(
            tenant_id = %tenant_id,
            device_id = %device_id,
            since,
            next_cursor,
            count = records.len(),
            has_more,
            "pull page served"
        );

        Ok(PullPage {
            records,
            next_cursor,
            has_more,
        })
    }

    /// Current server record, if any.
    pub async fn record(&self, tenant_id: &str, record_id: &str) -> Result<Option<ServerRecord>> {
        self.backend.fetch(tenant_id, record_id).await
    }

    /// Running stock total for a warehouse/product pair.
    pub async fn stock_total(
        &self,
        tenant_id: &str,
        warehouse_id: &str,
        product_id: &str,
    ) -> Result<f64> {
        self.backend
            .stock_total(tenant_id, warehouse_id, product_id)
            .await
    }

    /// Last change sequence a device has downloaded through.
    pub async fn device_cursor(&self, tenant_id: &str, device_id: &str) -> Result<u64> {
        self.backend.device_cursor(tenant_id, device_id).await
    }

    fn record_lock(&self, record_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(record_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
