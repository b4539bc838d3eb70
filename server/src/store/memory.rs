//! In-memory store backend for tests and single-process deployments.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use fieldsync_engine::{DeviceId, LedgerDelta, RecordId, ServerRecord, StockLedger, TenantId};

use super::{ChangeEntry, StoreBackend};
use crate::error::Result;

/// Backend keeping everything in concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<(TenantId, RecordId), ServerRecord>,
    owners: DashMap<RecordId, TenantId>,
    changes: DashMap<TenantId, Vec<ChangeEntry>>,
    ledgers: DashMap<TenantId, StockLedger>,
    cursors: DashMap<(TenantId, DeviceId), u64>,
    next_seq: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn fetch(&self, tenant_id: &str, record_id: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .records
            .get(&(tenant_id.to_string(), record_id.to_string()))
            .map(|r| r.clone()))
    }

    async fn owner_tenant(&self, record_id: &str) -> Result<Option<TenantId>> {
        Ok(self.owners.get(record_id).map(|t| t.clone()))
    }

    async fn commit(&self, record: &ServerRecord, ledger: Option<&LedgerDelta>) -> Result<u64> {
        self.owners
            .entry(record.record_id.clone())
            .or_insert_with(|| record.tenant_id.clone());
        self.records.insert(
            (record.tenant_id.clone(), record.record_id.clone()),
            record.clone(),
        );
        if let Some(delta) = ledger {
            self.ledgers
                .entry(record.tenant_id.clone())
                .or_default()
                .apply(delta);
        }

        // Seq is assigned while holding the tenant's log entry so the log
        // stays sorted even under concurrent commits.
        let mut log = self.changes.entry(record.tenant_id.clone()).or_default();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        log.push(ChangeEntry {
            seq,
            record_id: record.record_id.clone(),
        });
        Ok(seq)
    }

    async fn changes_since(
        &self,
        tenant_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        Ok(self
            .changes
            .get(tenant_id)
            .map(|log| {
                log.iter()
                    .filter(|c| c.seq > since)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stock_total(
        &self,
        tenant_id: &str,
        warehouse_id: &str,
        product_id: &str,
    ) -> Result<f64> {
        Ok(self
            .ledgers
            .get(tenant_id)
            .map(|ledger| ledger.total(warehouse_id, product_id))
            .unwrap_or(0.0))
    }

    async fn device_cursor(&self, tenant_id: &str, device_id: &str) -> Result<u64> {
        Ok(self
            .cursors
            .get(&(tenant_id.to_string(), device_id.to_string()))
            .map(|c| *c)
            .unwrap_or(0))
    }

    async fn set_device_cursor(
        &self,
        tenant_id: &str,
        device_id: &str,
        cursor: u64,
    ) -> Result<()> {
        let mut entry = self
            .cursors
            .entry((tenant_id.to_string(), device_id.to_string()))
            .or_insert(0);
        if cursor > *entry {
            *entry = cursor;
        }
        Ok(())
    }
}
