//! PostgreSQL store backend.
//!
//! Payloads are stored as JSONB and decoded on read; a row that no longer
//! matches a known payload shape surfaces as [`ServiceError::Corrupt`]
//! rather than being skipped.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;

use fieldsync_engine::{LedgerDelta, MergeEntry, ServerRecord, TenantId};

use super::{ChangeEntry, StoreBackend};
use crate::error::{Result, ServiceError};

pub type Pool = sqlx::PgPool;

/// Backend persisting to PostgreSQL.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect to the database and bring its schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }
}

/// Database row for a server record, before payload decoding.
struct RecordRow {
    tenant_id: String,
    record_id: String,
    device_id: String,
    created_at_device: i64,
    version: i64,
    payload: serde_json::Value,
    server_received_at: i64,
    server_version: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            record_id: row.try_get("record_id")?,
            device_id: row.try_get("device_id")?,
            created_at_device: row.try_get("created_at_device")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            server_received_at: row.try_get("server_received_at")?,
            server_version: row.try_get("server_version")?,
        })
    }
}

impl RecordRow {
    fn into_server_record(self, merge_history: Vec<MergeEntry>) -> Result<ServerRecord> {
        let payload = serde_json::from_value(self.payload).map_err(|e| {
            ServiceError::Corrupt(format!("payload of record {}: {}", self.record_id, e))
        })?;
        Ok(ServerRecord {
            record_id: self.record_id,
            tenant_id: self.tenant_id,
            device_id: self.device_id,
            created_at_device: self.created_at_device as u64,
            version: self.version as u64,
            payload,
            server_received_at: self.server_received_at as u64,
            server_version: self.server_version as u64,
            merge_history,
        })
    }
}

/// Database row for one merge history entry.
struct HistoryRow {
    record_id: String,
    version: i64,
    device_id: String,
    applied_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for HistoryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            record_id: row.try_get("record_id")?,
            version: row.try_get("version")?,
            device_id: row.try_get("device_id")?,
            applied_at: row.try_get("applied_at")?,
        })
    }
}

impl HistoryRow {
    fn into_merge_entry(self) -> MergeEntry {
        MergeEntry {
            record_id: self.record_id,
            version: self.version as u64,
            device_id: self.device_id,
            applied_at: self.applied_at as u64,
        }
    }
}

#[async_trait]
impl StoreBackend for PgBackend {
    async fn fetch(&self, tenant_id: &str, record_id: &str) -> Result<Option<ServerRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT tenant_id, record_id, device_id, created_at_device, version, payload,
                    server_received_at, server_version
             FROM server_records
             WHERE tenant_id = $1 AND record_id = $2",
        )
        .bind(tenant_id)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let history = sqlx::query_as::<_, HistoryRow>(
            "SELECT record_id, version, device_id, applied_at
             FROM merge_history
             WHERE tenant_id = $1 AND record_id = $2
             ORDER BY applied_at ASC, version ASC",
        )
        .bind(tenant_id)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(HistoryRow::into_merge_entry)
        .collect();

        row.into_server_record(history).map(Some)
    }

    async fn owner_tenant(&self, record_id: &str) -> Result<Option<TenantId>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT tenant_id FROM record_owners WHERE record_id = $1",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(tenant_id,)| tenant_id))
    }

    async fn commit(&self, record: &ServerRecord, ledger: Option<&LedgerDelta>) -> Result<u64> {
        let payload = serde_json::to_value(&record.payload).map_err(|e| {
            ServiceError::Corrupt(format!("payload of record {}: {}", record.record_id, e))
        })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO record_owners (record_id, tenant_id)
             VALUES ($1, $2)
             ON CONFLICT (record_id) DO NOTHING",
        )
        .bind(&record.record_id)
        .bind(&record.tenant_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO server_records
                 (tenant_id, record_id, device_id, created_at_device, version, payload,
                  server_received_at, server_version)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tenant_id, record_id) DO UPDATE SET
                 device_id = EXCLUDED.device_id,
                 created_at_device = EXCLUDED.created_at_device,
                 version = EXCLUDED.version,
                 payload = EXCLUDED.payload,
                 server_version = EXCLUDED.server_version",
        )
        .bind(&record.tenant_id)
        .bind(&record.record_id)
        .bind(&record.device_id)
        .bind(record.created_at_device as i64)
        .bind(record.version as i64)
        .bind(&payload)
        .bind(record.server_received_at as i64)
        .bind(record.server_version as i64)
        .execute(&mut *tx)
        .await?;

        // Only the newest history entry is new; replays of older ones no-op
        // on the primary key.
        if let Some(entry) = record.merge_history.last() {
            sqlx::query(
                "INSERT INTO merge_history (tenant_id, record_id, version, device_id, applied_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (record_id, version, device_id) DO NOTHING",
            )
            .bind(&record.tenant_id)
            .bind(&entry.record_id)
            .bind(entry.version as i64)
            .bind(&entry.device_id)
            .bind(entry.applied_at as i64)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(delta) = ledger {
            sqlx::query(
                "INSERT INTO stock_totals (tenant_id, warehouse_id, product_id, quantity)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (tenant_id, warehouse_id, product_id) DO UPDATE SET
                     quantity = stock_totals.quantity + EXCLUDED.quantity",
            )
            .bind(&record.tenant_id)
            .bind(&delta.warehouse_id)
            .bind(&delta.product_id)
            .bind(delta.quantity_delta)
            .execute(&mut *tx)
            .await?;
        }

        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO change_log (tenant_id, record_id) VALUES ($1, $2) RETURNING seq",
        )
        .bind(&record.tenant_id)
        .bind(&record.record_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(seq as u64)
    }

    async fn changes_since(
        &self,
        tenant_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT seq, record_id FROM change_log
             WHERE tenant_id = $1 AND seq > $2
             ORDER BY seq ASC
             LIMIT $3",
        )
        .bind(tenant_id)
        .bind(since as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(seq, record_id)| ChangeEntry {
                seq: seq as u64,
                record_id,
            })
            .collect())
    }

    async fn stock_total(
        &self,
        tenant_id: &str,
        warehouse_id: &str,
        product_id: &str,
    ) -> Result<f64> {
        let row = sqlx::query_as::<_, (f64,)>(
            "SELECT quantity FROM stock_totals
             WHERE tenant_id = $1 AND warehouse_id = $2 AND product_id = $3",
        )
        .bind(tenant_id)
        .bind(warehouse_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(quantity,)| quantity).unwrap_or(0.0))
    }

    async fn device_cursor(&self, tenant_id: &str, device_id: &str) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT cursor_seq FROM device_cursors WHERE tenant_id = $1 AND device_id = $2",
        )
        .bind(tenant_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(cursor,)| cursor as u64).unwrap_or(0))
    }

    async fn set_device_cursor(
        &self,
        tenant_id: &str,
        device_id: &str,
        cursor: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_cursors (tenant_id, device_id, cursor_seq)
             VALUES ($1, $2, $3)
             ON CONFLICT (tenant_id, device_id) DO UPDATE SET
                 cursor_seq = GREATEST(device_cursors.cursor_seq, EXCLUDED.cursor_seq),
                 updated_at = now()",
        )
        .bind(tenant_id)
        .bind(device_id)
        .bind(cursor as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
