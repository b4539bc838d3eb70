//! Per-device sync session.
//!
//! A session pairs a device's outbox with its read cache and exposes two
//! notification channels: a watch channel for the current [`SessionPhase`]
//! and an mpsc channel for rejection notices. The capture layer subscribes
//! to both to surface sync progress and parked records to the rep.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use fieldsync_engine::{Outbox, ReadCache, RejectReason, Version};

use crate::coordinator::SessionPhase;

/// Notification that a record was parked and needs operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionNotice {
    pub record_id: String,
    pub version: Version,
    pub reason: RejectReason,
}

/// Live sync state for one device.
pub struct SyncSession {
    session_id: String,
    outbox: Outbox,
    cache: ReadCache,
    phase_tx: watch::Sender<SessionPhase>,
    rejections_tx: mpsc::UnboundedSender<RejectionNotice>,
}

impl SyncSession {
    /// Creates a session around an outbox, returning the receiver for
    /// rejection notices alongside it.
    pub fn new(outbox: Outbox) -> (Self, mpsc::UnboundedReceiver<RejectionNotice>) {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        let (rejections_tx, rejections_rx) = mpsc::unbounded_channel();
        let session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            outbox,
            cache: ReadCache::new(),
            phase_tx,
            rejections_tx,
        };
        (session, rejections_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tenant_id(&self) -> &str {
        self.outbox.tenant_id()
    }

    pub fn device_id(&self) -> &str {
        self.outbox.device_id()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ReadCache {
        &mut self.cache
    }

    /// Current phase of the session.
    pub fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    /// Subscribes to phase changes.
    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        // send_replace delivers even when nobody is subscribed yet.
        self.phase_tx.send_replace(phase);
    }

    pub(crate) fn notify_rejection(&self, notice: RejectionNotice) {
        // A dropped receiver means the capture layer stopped listening;
        // the entry itself stays parked in the outbox either way.
        let _ = self.rejections_tx.send(notice);
    }
}
