//! Conflict resolution between incoming submissions and server state.
//!
//! # Algorithm
//!
//! 1. A duplicate submission (per [`resolve`]) is acknowledged as-is; nothing
//!    is reapplied, including business-rule checks.
//! 2. Defensive guards reject submissions whose tenant or payload kind
//!    disagrees with the existing record.
//! 3. Cash reconciliations for a closed period are rejected before any state
//!    is touched.
//! 4. The per-kind policy decides:
//!    - **Visit**: owned by the first device the server saw; other devices
//!      are rejected with `ConflictingOwner`. Within the owner, last write
//!      wins by version; stale versions are rejected with `SupersededBy`.
//!    - **Stock movement**: deltas are additive and never overwrite each
//!      other. Every non-duplicate submission contributes its delta to the
//!      running total, even when it arrives after a higher version.
//!    - **Cash reconciliation**: last write wins by version across devices.
//!      Equal versions are ordered by `(created_at_device, device_id)` so
//!      every replica picks the same winner.
//!
//! An applied outcome always increments `server_version`; no path rolls a
//! record back.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::RejectReason;
use crate::record::{MergeEntry, RecordPayload, ServerRecord, StockUnit, SyncableRecord};
use crate::resolve::Resolution;
use crate::{PeriodId, Timestamp, Version};

/// Merge-time tenant policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePolicy {
    /// Reconciliation periods no longer accepting cash submissions
    pub closed_periods: BTreeSet<PeriodId>,
}

impl MergePolicy {
    pub fn with_closed_period(mut self, period_id: impl Into<PeriodId>) -> Self {
        self.closed_periods.insert(period_id.into());
        self
    }

    pub fn is_closed(&self, period_id: &str) -> bool {
        self.closed_periods.contains(period_id)
    }
}

/// An adjustment to a tenant's stock running totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDelta {
    pub warehouse_id: String,
    pub product_id: String,
    pub quantity_delta: f64,
    pub unit: StockUnit,
}

/// What applying a submission produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The submission won; commit this state.
    Applied {
        record: ServerRecord,
        /// Stock total adjustment to commit alongside, for additive payloads
        ledger: Option<LedgerDelta>,
    },
    /// Already folded in; acknowledge without reapplying.
    Duplicate { server_version: Version },
    /// Refused; the device keeps the entry for manual resolution.
    Rejected(RejectReason),
}

/// Apply one submission against the current server record, if any.
///
/// Pure: the caller supplies the server clock and commits the returned
/// state. `resolution` must come from [`resolve`] over the same pair.
pub fn merge(
    incoming: &SyncableRecord,
    current: Option<&ServerRecord>,
    resolution: Resolution,
    policy: &MergePolicy,
    now_server: Timestamp,
) -> MergeOutcome {
    if resolution == Resolution::Duplicate {
        let server_version = current.map(|c| c.server_version).unwrap_or_default();
        return MergeOutcome::Duplicate { server_version };
    }

    if let Some(current) = current {
        if current.tenant_id != incoming.tenant_id {
            return MergeOutcome::Rejected(RejectReason::TenantMismatch);
        }
        if current.payload.kind() != incoming.payload.kind() {
            return MergeOutcome::Rejected(RejectReason::Invalid {
                detail: format!(
                    "payload kind changed from {} to {}",
                    current.payload.kind(),
                    incoming.payload.kind()
                ),
            });
        }
    }

    if let RecordPayload::CashReconciliation { period_id, .. } = &incoming.payload {
        if policy.is_closed(period_id) {
            return MergeOutcome::Rejected(RejectReason::PeriodClosed {
                period_id: period_id.clone(),
            });
        }
    }

    let Some(current) = current else {
        let ledger = ledger_delta(&incoming.payload);
        return MergeOutcome::Applied {
            record: ServerRecord::first(incoming, now_server),
            ledger,
        };
    };

    match &incoming.payload {
        RecordPayload::Visit { .. } => merge_visit(incoming, current, resolution, now_server),
        RecordPayload::StockMovement { .. } => merge_stock(incoming, current, now_server),
        RecordPayload::CashReconciliation { .. } => {
            merge_cash(incoming, current, resolution, now_server)
        }
    }
}

fn merge_visit(
    incoming: &SyncableRecord,
    current: &ServerRecord,
    resolution: Resolution,
    now_server: Timestamp,
) -> MergeOutcome {
    // Visits are single-writer: the device whose submission arrived first
    // owns the record id for good.
    if incoming.device_id != current.device_id {
        return MergeOutcome::Rejected(RejectReason::ConflictingOwner {
            owner_device: current.device_id.clone(),
        });
    }
    if resolution == Resolution::Superseded {
        return MergeOutcome::Rejected(RejectReason::SupersededBy {
            applied_version: current.version,
        });
    }
    MergeOutcome::Applied {
        record: applied(current, incoming, now_server),
        ledger: None,
    }
}

fn merge_stock(
    incoming: &SyncableRecord,
    current: &ServerRecord,
    now_server: Timestamp,
) -> MergeOutcome {
    let ledger = ledger_delta(&incoming.payload);
    let record = if incoming.version >= current.version {
        applied(current, incoming, now_server)
    } else {
        // Late lower version: the delta still counts, but the newer payload
        // stays the representative state.
        let mut next = current.clone();
        next.server_version = current.server_version + 1;
        next.merge_history.push(MergeEntry {
            record_id: incoming.record_id.clone(),
            version: incoming.version,
            device_id: incoming.device_id.clone(),
            applied_at: now_server,
        });
        next
    };
    MergeOutcome::Applied { record, ledger }
}

fn merge_cash(
    incoming: &SyncableRecord,
    current: &ServerRecord,
    resolution: Resolution,
    now_server: Timestamp,
) -> MergeOutcome {
    if resolution == Resolution::Superseded {
        return MergeOutcome::Rejected(RejectReason::SupersededBy {
            applied_version: current.version,
        });
    }
    if incoming.version == current.version {
        // Concurrent counts with the same version: a total order over
        // (created_at_device, device_id) picks the same winner everywhere.
        let incoming_wins = (incoming.created_at_device, incoming.device_id.as_str())
            > (current.created_at_device, current.device_id.as_str());
        if !incoming_wins {
            return MergeOutcome::Rejected(RejectReason::SupersededBy {
                applied_version: current.version,
            });
        }
    }
    MergeOutcome::Applied {
        record: applied(current, incoming, now_server),
        ledger: None,
    }
}

/// Produce the next server record with the incoming submission as winner.
fn applied(current: &ServerRecord, incoming: &SyncableRecord, now_server: Timestamp) -> ServerRecord {
    let mut next = current.clone();
    next.device_id = incoming.device_id.clone();
    next.created_at_device = incoming.created_at_device;
    next.version = incoming.version;
    next.payload = incoming.payload.clone();
    next.server_version = current.server_version + 1;
    next.merge_history.push(MergeEntry {
        record_id: incoming.record_id.clone(),
        version: incoming.version,
        device_id: incoming.device_id.clone(),
        applied_at: now_server,
    });
    next
}

fn ledger_delta(payload: &RecordPayload) -> Option<LedgerDelta> {
    match payload {
        RecordPayload::StockMovement {
            warehouse_id,
            product_id,
            quantity_delta,
            unit,
        } => Some(LedgerDelta {
            warehouse_id: warehouse_id.clone(),
            product_id: product_id.clone(),
            quantity_delta: *quantity_delta,
            unit: *unit,
        }),
        _ => None,
    }
}

/// Running stock totals for one tenant, keyed by warehouse and product.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StockLedger {
    totals: BTreeMap<(String, String), f64>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a committed delta into the running totals.
    pub fn apply(&mut self, delta: &LedgerDelta) {
        *self
            .totals
            .entry((delta.warehouse_id.clone(), delta.product_id.clone()))
            .or_insert(0.0) += delta.quantity_delta;
    }

    /// Current total for a warehouse/product pair, zero when never moved.
    pub fn total(&self, warehouse_id: &str, product_id: &str) -> f64 {
        self.totals
            .get(&(warehouse_id.to_string(), product_id.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, String), &f64)> {
        self.totals.iter()
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::resolve;

    fn visit(device_id: &str, version: u64, created_at: u64) -> SyncableRecord {
        let mut record = SyncableRecord::new(
            "r1",
            "t1",
            device_id,
            created_at,
            RecordPayload::Visit {
                outlet_id: "outlet_1".to_string(),
                latitude: 40.4,
                longitude: 49.8,
                accuracy_m: 10.0,
            },
        );
        record.version = version;
        record
    }

    fn stock(record_id: &str, version: u64, delta: f64) -> SyncableRecord {
        let mut record = SyncableRecord::new(
            record_id,
            "t1",
            "d1",
            1000,
            RecordPayload::StockMovement {
                warehouse_id: "w1".to_string(),
                product_id: "p1".to_string(),
                quantity_delta: delta,
                unit: StockUnit::Each,
            },
        );
        record.version = version;
        record
    }

    fn cash(device_id: &str, version: u64, created_at: u64, counted: i64) -> SyncableRecord {
        let mut record = SyncableRecord::new(
            "r1",
            "t1",
            device_id,
            created_at,
            RecordPayload::CashReconciliation {
                period_id: "2024-02".to_string(),
                counted_minor: counted,
                expected_minor: counted,
                currency: "AZN".to_string(),
            },
        );
        record.version = version;
        record
    }

    fn run(incoming: &SyncableRecord, current: Option<&ServerRecord>, now: u64) -> MergeOutcome {
        let resolution = resolve(incoming, current);
        merge(incoming, current, resolution, &MergePolicy::default(), now)
    }

    fn applied_record(outcome: MergeOutcome) -> ServerRecord {
        match outcome {
            MergeOutcome::Applied { record, .. } => record,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn first_submission_is_applied() {
        let record = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        assert_eq!(record.server_version, 1);
        assert_eq!(record.version, 1);
        assert_eq!(record.merge_history.len(), 1);
    }

    #[test]
    fn replay_is_acknowledged_without_reapplying() {
        let server = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        let outcome = run(&visit("d1", 1, 1000), Some(&server), 6000);
        assert_eq!(
            outcome,
            MergeOutcome::Duplicate {
                server_version: server.server_version
            }
        );
    }

    #[test]
    fn visit_update_from_owner_wins() {
        let server = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        let next = applied_record(run(&visit("d1", 2, 2000), Some(&server), 6000));
        assert_eq!(next.version, 2);
        assert_eq!(next.server_version, 2);
        assert_eq!(next.server_received_at, 5000);
        assert_eq!(next.merge_history.len(), 2);
    }

    #[test]
    fn visit_from_other_device_is_rejected() {
        let server = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        let outcome = run(&visit("d2", 2, 2000), Some(&server), 6000);
        assert_eq!(
            outcome,
            MergeOutcome::Rejected(RejectReason::ConflictingOwner {
                owner_device: "d1".to_string()
            })
        );
    }

    #[test]
    fn stale_visit_is_rejected() {
        let server = applied_record(run(&visit("d1", 3, 3000), None, 5000));
        let outcome = run(&visit("d1", 2, 2000), Some(&server), 6000);
        assert_eq!(
            outcome,
            MergeOutcome::Rejected(RejectReason::SupersededBy { applied_version: 3 })
        );
    }

    #[test]
    fn stock_delta_is_reported_for_commit() {
        let outcome = run(&stock("s1", 1, 7.5), None, 5000);
        match outcome {
            MergeOutcome::Applied { ledger: Some(delta), .. } => {
                assert_eq!(delta.quantity_delta, 7.5);
                assert_eq!(delta.warehouse_id, "w1");
            }
            other => panic!("expected applied stock delta, got {other:?}"),
        }
    }

    #[test]
    fn retried_stock_delta_is_not_double_counted() {
        let server = applied_record(run(&stock("s1", 1, 7.5), None, 5000));
        let outcome = run(&stock("s1", 1, 7.5), Some(&server), 6000);
        assert!(matches!(outcome, MergeOutcome::Duplicate { .. }));
    }

    #[test]
    fn late_lower_stock_version_still_counts_its_delta() {
        let server = applied_record(run(&stock("s1", 2, 4.0), None, 5000));
        let outcome = run(&stock("s1", 1, 3.0), Some(&server), 6000);
        match outcome {
            MergeOutcome::Applied { record, ledger } => {
                // The newer payload stays representative; the delta is counted.
                assert_eq!(record.version, 2);
                assert_eq!(record.server_version, 2);
                assert_eq!(record.merge_history.len(), 2);
                assert_eq!(ledger.map(|d| d.quantity_delta), Some(3.0));
            }
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[test]
    fn cash_last_write_wins_across_devices() {
        let server = applied_record(run(&cash("d1", 1, 1000, 100), None, 5000));
        let next = applied_record(run(&cash("d2", 2, 2000, 200), Some(&server), 6000));
        assert_eq!(next.version, 2);
        assert_eq!(next.device_id, "d2");
        match &next.payload {
            RecordPayload::CashReconciliation { counted_minor, .. } => {
                assert_eq!(*counted_minor, 200)
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn stale_cash_retry_is_superseded() {
        let server = applied_record(run(&cash("d1", 1, 1000, 100), None, 5000));
        let server = applied_record(run(&cash("d2", 2, 2000, 200), Some(&server), 6000));
        let outcome = run(&cash("d1", 1, 1000, 100), Some(&server), 7000);
        assert_eq!(
            outcome,
            MergeOutcome::Rejected(RejectReason::SupersededBy { applied_version: 2 })
        );
    }

    #[test]
    fn equal_cash_versions_pick_later_device_capture() {
        let server = applied_record(run(&cash("d1", 1, 1000, 100), None, 5000));

        // Later capture time wins.
        let winner = applied_record(run(&cash("d2", 1, 2000, 200), Some(&server), 6000));
        assert_eq!(winner.device_id, "d2");

        // The displaced value now loses on replaying the comparison.
        let outcome = run(&cash("d1", 1, 1000, 100), Some(&winner), 7000);
        assert!(matches!(outcome, MergeOutcome::Duplicate { .. }));
    }

    #[test]
    fn equal_cash_versions_and_timestamps_break_tie_by_device_id() {
        let server = applied_record(run(&cash("da", 1, 1000, 100), None, 5000));
        let winner = applied_record(run(&cash("db", 1, 1000, 200), Some(&server), 6000));
        assert_eq!(winner.device_id, "db");

        // Reversed arrival order converges on the same winner.
        let server = applied_record(run(&cash("db", 1, 1000, 200), None, 5000));
        let outcome = run(&cash("da", 1, 1000, 100), Some(&server), 6000);
        assert!(matches!(
            outcome,
            MergeOutcome::Rejected(RejectReason::SupersededBy { .. })
        ));
    }

    #[test]
    fn closed_period_rejects_cash() {
        let policy = MergePolicy::default().with_closed_period("2024-02");
        let incoming = cash("d1", 1, 1000, 100);
        let outcome = merge(&incoming, None, Resolution::New, &policy, 5000);
        assert_eq!(
            outcome,
            MergeOutcome::Rejected(RejectReason::PeriodClosed {
                period_id: "2024-02".to_string()
            })
        );
    }

    #[test]
    fn duplicate_outranks_closed_period() {
        // A replayed ack-lost submission must stay acknowledgeable after the
        // period closes, or the device could never drain its outbox.
        let incoming = cash("d1", 1, 1000, 100);
        let server = applied_record(run(&incoming, None, 5000));
        let policy = MergePolicy::default().with_closed_period("2024-02");
        let resolution = resolve(&incoming, Some(&server));
        let outcome = merge(&incoming, Some(&server), resolution, &policy, 6000);
        assert!(matches!(outcome, MergeOutcome::Duplicate { .. }));
    }

    #[test]
    fn tenant_change_is_rejected() {
        let server = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        let mut incoming = visit("d1", 2, 2000);
        incoming.tenant_id = "t2".to_string();
        let outcome = run(&incoming, Some(&server), 6000);
        assert_eq!(outcome, MergeOutcome::Rejected(RejectReason::TenantMismatch));
    }

    #[test]
    fn payload_kind_change_is_rejected() {
        let server = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        let mut incoming = stock("r1", 2, 1.0);
        incoming.device_id = "d1".to_string();
        let outcome = run(&incoming, Some(&server), 6000);
        assert!(matches!(
            outcome,
            MergeOutcome::Rejected(RejectReason::Invalid { .. })
        ));
    }

    #[test]
    fn server_version_never_decreases() {
        let mut server = applied_record(run(&visit("d1", 1, 1000), None, 5000));
        let mut last = server.server_version;
        for version in [3u64, 2, 5, 4, 6] {
            let outcome = run(&visit("d1", version, version * 1000), Some(&server), 6000);
            if let MergeOutcome::Applied { record, .. } = outcome {
                assert!(record.server_version > last);
                last = record.server_version;
                server = record;
            }
        }
        assert_eq!(server.version, 6);
    }

    #[test]
    fn ledger_accumulates_totals() {
        let mut ledger = StockLedger::new();
        for (delta, product) in [(5.0, "p1"), (-2.0, "p1"), (7.0, "p2")] {
            ledger.apply(&LedgerDelta {
                warehouse_id: "w1".to_string(),
                product_id: product.to_string(),
                quantity_delta: delta,
                unit: StockUnit::Each,
            });
        }
        assert_eq!(ledger.total("w1", "p1"), 3.0);
        assert_eq!(ledger.total("w1", "p2"), 7.0);
        assert_eq!(ledger.total("w1", "p3"), 0.0);
        assert_eq!(ledger.len(), 2);
    }

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn apply_sequence(submissions: &[(u8, u64, u64)]) -> Option<ServerRecord> {
            let mut current: Option<ServerRecord> = None;
            for (step, (device, version, created_at)) in submissions.iter().enumerate() {
                let incoming = cash(&format!("d{device}"), *version, *created_at, 100);
                let outcome = run(&incoming, current.as_ref(), 5000 + step as u64);
                if let MergeOutcome::Applied { record, .. } = outcome {
                    current = Some(record);
                }
            }
            current
        }

        proptest! {
            #[test]
            fn prop_merge_is_deterministic(
                submissions in prop::collection::vec((0u8..3, 1u64..6, 1000u64..1005), 1..12)
            ) {
                let first = apply_sequence(&submissions);
                let second = apply_sequence(&submissions);
                prop_assert_eq!(first, second);
            }

            #[test]
            fn prop_server_version_is_monotonic(
                submissions in prop::collection::vec((0u8..3, 1u64..6, 1000u64..1005), 1..12)
            ) {
                let mut current: Option<ServerRecord> = None;
                for (step, (device, version, created_at)) in submissions.iter().enumerate() {
                    let incoming = cash(&format!("d{device}"), *version, *created_at, 100);
                    let outcome = run(&incoming, current.as_ref(), 5000 + step as u64);
                    if let MergeOutcome::Applied { record, .. } = outcome {
                        let previous = current.as_ref().map(|c| c.server_version).unwrap_or(0);
                        prop_assert!(record.server_version > previous);
                        current = Some(record);
                    }
                }
            }

            #[test]
            fn prop_stock_totals_are_order_independent(
                deltas in prop::collection::vec(-100.0f64..100.0, 1..10).prop_flat_map(|deltas| {
                    let indexed: Vec<(usize, f64)> = deltas.into_iter().enumerate().collect();
                    Just(indexed).prop_shuffle()
                })
            ) {
                let expected: f64 = deltas.iter().map(|(_, d)| d).sum();
                let mut ledger = StockLedger::new();
                let mut records: BTreeMap<String, ServerRecord> = BTreeMap::new();
                for (index, delta) in &deltas {
                    let incoming = stock(&format!("s{index}"), 1, *delta);
                    let current = records.get(&incoming.record_id);
                    let outcome = run(&incoming, current, 5000);
                    if let MergeOutcome::Applied { record, ledger: Some(change) } = outcome {
                        ledger.apply(&change);
                        records.insert(record.record_id.clone(), record);
                    }
                }
                let total = ledger.total("w1", "p1");
                prop_assert!((total - expected).abs() < 1e-6);
            }
        }
    }
}
