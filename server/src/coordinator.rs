//! Sync pass orchestration.
//!
//! A pass uploads the session's outbox in batches, then downloads tenant
//! changes into its read cache. Transient transport failures back off
//! exponentially and retry; a record that keeps failing past the attempt
//! budget is parked as rejected so one poison record cannot wedge the
//! queue. Cancellation is checked between batches, never mid-claim, so an
//! interrupted pass leaves every entry either pending or safely in flight
//! where the timeout will reclaim it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fieldsync_engine::{EntryKey, PushAck, RejectReason, SyncState, SyncableRecord};

use crate::config::SyncSettings;
use crate::error::Result;
use crate::session::{RejectionNotice, SyncSession};
use crate::transport::SyncTransport;

/// Where a session currently is in its sync lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Uploading,
    Downloading,
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Uploading => "uploading",
            SessionPhase::Downloading => "downloading",
            SessionPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub downloaded: usize,
    pub cancelled: bool,
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives upload and download passes for device sessions.
pub struct SyncCoordinator {
    transport: Arc<dyn SyncTransport>,
    settings: SyncSettings,
}

impl SyncCoordinator {
    pub fn new(transport: Arc<dyn SyncTransport>, settings: SyncSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Runs one full sync pass: upload until the outbox drains, then pull
    /// changes until the cache catches up to the tenant change stream.
    ///
    /// Flipping `cancel` to `true` stops the pass at the next batch
    /// boundary with `cancelled` set in the summary.
    pub async fn run_pass(
        &self,
        session: &mut SyncSession,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        info!(
            session_id = %session.session_id(),
            tenant_id = %session.tenant_id(),
            device_id = %session.device_id(),
            pending = session.outbox().pending_count(),
            "sync pass started"
        );

        session.set_phase(SessionPhase::Uploading);
        if !self.upload(session, cancel, &mut summary).await? {
            summary.phase = session.phase();
            return Ok(summary);
        }

        session.set_phase(SessionPhase::Downloading);
        if !self.download(session, cancel, &mut summary).await? {
            summary.phase = session.phase();
            return Ok(summary);
        }

        session.set_phase(SessionPhase::Idle);
        summary.phase = SessionPhase::Idle;
        info!(
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            downloaded = summary.downloaded,
            "sync pass finished"
        );
        Ok(summary)
    }

    /// Pushes pending batches until the outbox drains. Returns false when
    /// the pass should stop early (cancelled or failed).
    async fn upload(
        &self,
        session: &mut SyncSession,
        cancel: &mut watch::Receiver<bool>,
        summary: &mut PassSummary,
    ) -> Result<bool> {
        let mut transient_failures: u32 = 0;
        loop {
            if *cancel.borrow() {
                summary.cancelled = true;
                session.set_phase(SessionPhase::Idle);
                return Ok(false);
            }
            self.park_exhausted(session, summary)?;

            let now = crate::now_ms();
            let batch = session
                .outbox_mut()
                .list_pending(self.settings.batch_size, now);
            if batch.is_empty() {
                return Ok(true);
            }

            let keys: Vec<EntryKey> = batch.iter().map(|entry| entry.key()).collect();
            session.outbox_mut().mark_in_flight(&keys, now)?;
            let records: Vec<SyncableRecord> =
                batch.into_iter().map(|entry| entry.record).collect();

            match self
                .transport
                .push(session.tenant_id(), session.device_id(), records)
                .await
            {
                Ok(acks) => {
                    transient_failures = 0;
                    debug!(batch = keys.len(), "batch pushed");
                    self.apply_acks(session, acks, summary)?;
                }
                Err(e) if e.is_transient() => {
                    session.outbox_mut().release(&keys);
                    transient_failures += 1;
                    warn!(
                        error = %e,
                        attempt = transient_failures,
                        "push failed, backing off"
                    );
                    if transient_failures >= self.settings.max_attempts {
                        summary.error = Some(e.to_string());
                        session.set_phase(SessionPhase::Failed);
                        return Ok(false);
                    }
                    if !self.backoff(transient_failures, cancel).await {
                        summary.cancelled = true;
                        session.set_phase(SessionPhase::Idle);
                        return Ok(false);
                    }
                }
                Err(e) => {
                    session.outbox_mut().release(&keys);
                    warn!(error = %e, "push failed permanently");
                    summary.error = Some(e.to_string());
                    session.set_phase(SessionPhase::Failed);
                    return Ok(false);
                }
            }
        }
    }

    /// Parks pending entries that already burned their attempt budget.
    fn park_exhausted(&self, session: &mut SyncSession, summary: &mut PassSummary) -> Result<()> {
        let exhausted: Vec<(EntryKey, u32)> = session
            .outbox()
            .entries()
            .filter(|entry| {
                entry.sync_state == SyncState::Pending
                    && entry.attempt_count >= self.settings.max_attempts
            })
            .map(|entry| (entry.key(), entry.attempt_count))
            .collect();

        for (key, attempts) in exhausted {
            warn!(
                record_id = %key.0,
                version = key.1,
                attempts,
                "record exhausted its retry budget"
            );
            let reason = RejectReason::RetriesExhausted { attempts };
            session.outbox_mut().mark_rejected(&key, reason.clone())?;
            session.notify_rejection(RejectionNotice {
                record_id: key.0,
                version: key.1,
                reason,
            });
            summary.rejected += 1;
        }
        Ok(())
    }

    /// Settles one batch of acks against the outbox.
    fn apply_acks(
        &self,
        session: &mut SyncSession,
        acks: Vec<PushAck>,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let mut done: Vec<EntryKey> = Vec::new();
        for ack in acks {
            match ack {
                PushAck::Accepted {
                    record_id, version, ..
                } => {
                    summary.accepted += 1;
                    done.push((record_id, version));
                }
                PushAck::Duplicate {
                    record_id, version, ..
                } => {
                    summary.duplicates += 1;
                    done.push((record_id, version));
                }
                PushAck::Rejected {
                    record_id,
                    version,
                    reason,
                } => {
                    summary.rejected += 1;
                    warn!(
                        record_id = %record_id,
                        version,
                        reason = %reason,
                        "record rejected by server"
                    );
                    let key = (record_id.clone(), version);
                    session.outbox_mut().mark_rejected(&key, reason.clone())?;
                    session.notify_rejection(RejectionNotice {
                        record_id,
                        version,
                        reason,
                    });
                }
            }
        }
        session.outbox_mut().mark_acknowledged(&done);
        Ok(())
    }

    /// Pulls change pages until the server reports no more. Returns false
    /// when the pass should stop early.
    async fn download(
        &self,
        session: &mut SyncSession,
        cancel: &mut watch::Receiver<bool>,
        summary: &mut PassSummary,
    ) -> Result<bool> {
        let mut transient_failures: u32 = 0;
        loop {
            if *cancel.borrow() {
                summary.cancelled = true;
                session.set_phase(SessionPhase::Idle);
                return Ok(false);
            }

            let since = session.cache().cursor();
            match self
                .transport
                .pull(
                    session.tenant_id(),
                    session.device_id(),
                    since,
                    self.settings.pull_limit,
                )
                .await
            {
                Ok(page) => {
                    transient_failures = 0;
                    let mut applied = 0usize;
                    for record in page.records {
                        if session.cache_mut().apply(record) {
                            applied += 1;
                        }
                    }
                    summary.downloaded += applied;
                    session.cache_mut().advance_cursor(page.next_cursor);
                    debug!(since, next = page.next_cursor, applied, "page pulled");
                    if !page.has_more {
                        return Ok(true);
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    warn!(
                        error = %e,
                        attempt = transient_failures,
                        "pull failed, backing off"
                    );
                    if transient_failures >= self.settings.max_attempts {
                        summary.error = Some(e.to_string());
                        session.set_phase(SessionPhase::Failed);
                        return Ok(false);
                    }
                    if !self.backoff(transient_failures, cancel).await {
                        summary.cancelled = true;
                        session.set_phase(SessionPhase::Idle);
                        return Ok(false);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pull failed permanently");
                    summary.error = Some(e.to_string());
                    session.set_phase(SessionPhase::Failed);
                    return Ok(false);
                }
            }
        }
    }

    fn retry_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.settings
            .retry_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.settings.retry_cap)
    }

    /// Sleeps out the backoff window. Returns false if cancelled meanwhile.
    async fn backoff(&self, failures: u32, cancel: &mut watch::Receiver<bool>) -> bool {
        let delay = self.retry_delay(failures);
        debug!(delay_ms = delay.as_millis() as u64, "waiting before retry");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.changed() => !*cancel.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthoritativeStore, MemoryBackend, PullPage};
    use crate::transport::{InProcessTransport, TransportError};

    fn coordinator(settings: SyncSettings) -> SyncCoordinator {
        let store = AuthoritativeStore::new(Arc::new(MemoryBackend::new()));
        SyncCoordinator::new(Arc::new(InProcessTransport::new(Arc::new(store))), settings)
    }

    #[test]
    fn retry_delay_doubles_per_failure() {
        let coordinator = coordinator(SyncSettings {
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(300),
            ..SyncSettings::default()
        });
        assert_eq!(coordinator.retry_delay(1), Duration::from_secs(5));
        assert_eq!(coordinator.retry_delay(2), Duration::from_secs(10));
        assert_eq!(coordinator.retry_delay(3), Duration::from_secs(20));
        assert_eq!(coordinator.retry_delay(4), Duration::from_secs(40));
    }

    #[test]
    fn retry_delay_is_capped() {
        let coordinator = coordinator(SyncSettings {
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(300),
            ..SyncSettings::default()
        });
        assert_eq!(coordinator.retry_delay(10), Duration::from_secs(300));
        assert_eq!(coordinator.retry_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn phase_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&SessionPhase::Uploading).unwrap(),
            "\"uploading\""
        );
        assert_eq!(SessionPhase::Downloading.to_string(), "downloading");
    }

    #[test]
    fn summary_omits_absent_error() {
        let json = serde_json::to_string(&PassSummary::default()).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"phase\":\"idle\""));
    }

    struct FailingTransport;

    #[async_trait::async_trait]
    impl SyncTransport for FailingTransport {
        async fn push(
            &self,
            _tenant_id: &str,
            _device_id: &str,
            _batch: Vec<SyncableRecord>,
        ) -> std::result::Result<Vec<PushAck>, TransportError> {
            Err(TransportError::fatal("push refused"))
        }

        async fn pull(
            &self,
            _tenant_id: &str,
            _device_id: &str,
            _since: u64,
            _limit: usize,
        ) -> std::result::Result<PullPage, TransportError> {
            Err(TransportError::fatal("pull refused"))
        }
    }

    #[tokio::test]
    async fn fatal_pull_error_fails_the_pass() {
        let coordinator =
            SyncCoordinator::new(Arc::new(FailingTransport), SyncSettings::default());
        let (mut session, _rx) =
            SyncSession::new(fieldsync_engine::Outbox::new("d-1", "acme"));
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);

        // Empty outbox skips upload entirely, so the fatal pull is hit.
        let summary = coordinator
            .run_pass(&mut session, &mut cancel_rx)
            .await
            .unwrap();
        assert_eq!(summary.phase, SessionPhase::Failed);
        assert!(summary.error.is_some());
        assert_eq!(session.phase(), SessionPhase::Failed);
    }
}
