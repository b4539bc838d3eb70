//! Transport seam between device sessions and the authoritative store.
//!
//! The coordinator only talks [`SyncTransport`], so a session can run
//! against the in-process store directly or against a remote edge that
//! speaks the same push/pull shapes. Errors carry a transient flag; the
//! coordinator retries transient failures and gives up on fatal ones.

use std::sync::Arc;

use async_trait::async_trait;

use fieldsync_engine::{PushAck, SyncableRecord};

use crate::error::ServiceError;
use crate::store::{AuthoritativeStore, PullPage};

/// Transport-level failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    transient: bool,
}

impl TransportError {
    /// A failure worth retrying, such as a dropped connection.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure that will not go away on its own.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<ServiceError> for TransportError {
    fn from(err: ServiceError) -> Self {
        if err.is_transient() {
            Self::transient(err.to_string())
        } else {
            Self::fatal(err.to_string())
        }
    }
}

/// Push and pull operations a sync pass needs from the server side.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Uploads a batch of records for one device, returning one ack per
    /// record in submission order.
    async fn push(
        &self,
        tenant_id: &str,
        device_id: &str,
        batch: Vec<SyncableRecord>,
    ) -> Result<Vec<PushAck>, TransportError>;

    /// Downloads tenant changes after `since`, at most `limit` records.
    async fn pull(
        &self,
        tenant_id: &str,
        device_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<PullPage, TransportError>;
}

/// Transport that calls the store in the same process.
pub struct InProcessTransport {
    store: Arc<AuthoritativeStore>,
}

impl InProcessTransport {
    pub fn new(store: Arc<AuthoritativeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn push(
        &self,
        tenant_id: &str,
        device_id: &str,
        batch: Vec<SyncableRecord>,
    ) -> Result<Vec<PushAck>, TransportError> {
        // A batch claiming another tenant or device than the session it
        // rides on is malformed, not a data conflict.
        for record in &batch {
            if record.tenant_id != tenant_id {
                return Err(TransportError::fatal(format!(
                    "record '{}' claims tenant '{}' on a session for tenant '{}'",
                    record.record_id, record.tenant_id, tenant_id
                )));
            }
            if record.device_id != device_id {
                return Err(TransportError::fatal(format!(
                    "record '{}' claims device '{}' on a session for device '{}'",
                    record.record_id, record.device_id, device_id
                )));
            }
        }
        self.store.submit_batch(batch).await.map_err(Into::into)
    }

    async fn pull(
        &self,
        tenant_id: &str,
        device_id: &str,
        since: u64,
        limit: usize,
    ) -> Result<PullPage, TransportError> {
        self.store
            .pull(tenant_id, device_id, since, limit)
            .await
            .map_err(Into::into)
    }
}
