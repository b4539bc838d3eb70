//! Integration tests for the authoritative store.
//!
//! These run against the in-memory backend, so they exercise the full
//! submit/merge/pull path without needing a database.

use std::sync::Arc;

use fieldsync_engine::{PushAck, RecordPayload, RejectReason, StockUnit, SyncableRecord};
use fieldsync_server::{AuthoritativeStore, MemoryBackend, TenantPolicy};

// ==== Helpers ====

fn store() -> AuthoritativeStore {
    AuthoritativeStore::new(Arc::new(MemoryBackend::new()))
}

fn visit(record_id: &str, tenant_id: &str, device_id: &str) -> SyncableRecord {
    SyncableRecord::new(
        record_id,
        tenant_id,
        device_id,
        1_000,
        RecordPayload::Visit {
            outlet_id: "outlet-17".into(),
            latitude: 40.4093,
            longitude: 49.8671,
            accuracy_m: 8.0,
        },
    )
}

fn stock(record_id: &str, tenant_id: &str, device_id: &str, delta: f64) -> SyncableRecord {
    SyncableRecord::new(
        record_id,
        tenant_id,
        device_id,
        1_000,
        RecordPayload::StockMovement {
            warehouse_id: "wh-1".into(),
            product_id: "sku-9".into(),
            quantity_delta: delta,
            unit: StockUnit::Each,
        },
    )
}

fn cash(
    record_id: &str,
    tenant_id: &str,
    device_id: &str,
    period_id: &str,
    counted_minor: i64,
) -> SyncableRecord {
    SyncableRecord::new(
        record_id,
        tenant_id,
        device_id,
        1_000,
        RecordPayload::CashReconciliation {
            period_id: period_id.into(),
            counted_minor,
            expected_minor: 50_000,
            currency: "AZN".into(),
        },
    )
}

fn accepted_server_version(ack: &PushAck) -> u64 {
    match ack {
        PushAck::Accepted { server_version, .. } => *server_version,
        other => panic!("expected Accepted, got {other:?}"),
    }
}

fn rejection_reason(ack: &PushAck) -> &RejectReason {
    match ack {
        PushAck::Rejected { reason, .. } => reason,
        other => panic!("expected Rejected, got {other:?}"),
    }
}

// ==== Submission and replay ====

#[tokio::test]
async fn first_submission_is_accepted() {
    let store = store();
    let ack = store.submit(&visit("r-1", "acme", "d-1")).await.unwrap();
    assert_eq!(accepted_server_version(&ack), 1);

    let record = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.server_version, 1);
    assert_eq!(record.device_id, "d-1");
}

#[tokio::test]
async fn replayed_submission_is_a_duplicate_without_side_effects() {
    let store = store();
    let record = stock("r-1", "acme", "d-1", 10.0);

    let first = store.submit(&record).await.unwrap();
    assert!(matches!(first, PushAck::Accepted { .. }));

    // Ack lost, device retransmits the identical record.
    let second = store.submit(&record).await.unwrap();
    assert!(matches!(
        second,
        PushAck::Duplicate {
            server_version: 1,
            ..
        }
    ));

    let total = store.stock_total("acme", "wh-1", "sku-9").await.unwrap();
    assert_eq!(total, 10.0);
    let stored = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(stored.server_version, 1);
    assert_eq!(stored.merge_history.len(), 1);
}

#[tokio::test]
async fn visit_updates_apply_last_writer_wins() {
    let store = store();
    let v1 = visit("r-1", "acme", "d-1");
    let v2 = v1.next_version(
        RecordPayload::Visit {
            outlet_id: "outlet-17".into(),
            latitude: 40.5,
            longitude: 49.9,
            accuracy_m: 4.0,
        },
        2_000,
    );

    store.submit(&v1).await.unwrap();
    let ack = store.submit(&v2).await.unwrap();
    assert_eq!(accepted_server_version(&ack), 2);

    let record = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(record.version, 2);
    match &record.payload {
        RecordPayload::Visit { latitude, .. } => assert_eq!(*latitude, 40.5),
        other => panic!("expected visit payload, got {other:?}"),
    }
}

// ==== Conflict policy ====

#[tokio::test]
async fn visit_record_belongs_to_the_first_device() {
    let store = store();
    store.submit(&visit("r-1", "acme", "d-1")).await.unwrap();

    let mut intruder = visit("r-1", "acme", "d-2");
    intruder.version = 5;
    let ack = store.submit(&intruder).await.unwrap();
    match rejection_reason(&ack) {
        RejectReason::ConflictingOwner { owner_device } => assert_eq!(owner_device, "d-1"),
        other => panic!("expected ConflictingOwner, got {other:?}"),
    }

    // Owner unchanged.
    let record = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(record.device_id, "d-1");
    assert_eq!(record.version, 1);
}

#[tokio::test]
async fn stale_cash_version_is_superseded() {
    let store = store();
    let v1 = cash("r-1", "acme", "d-1", "2024-03", 48_000);
    let v2 = v1.next_version(
        RecordPayload::CashReconciliation {
            period_id: "2024-03".into(),
            counted_minor: 49_500,
            expected_minor: 50_000,
            currency: "AZN".into(),
        },
        2_000,
    );

    store.submit(&v2).await.unwrap();
    let ack = store.submit(&v1).await.unwrap();
    match rejection_reason(&ack) {
        RejectReason::SupersededBy { applied_version } => assert_eq!(*applied_version, 2),
        other => panic!("expected SupersededBy, got {other:?}"),
    }
}

#[tokio::test]
async fn closed_period_rejects_new_reconciliations() {
    let store = store();
    let mut policy = TenantPolicy::default();
    policy.close_period("2024-02");
    store.set_tenant_policy("acme", policy);

    let ack = store
        .submit(&cash("r-1", "acme", "d-1", "2024-02", 48_000))
        .await
        .unwrap();
    match rejection_reason(&ack) {
        RejectReason::PeriodClosed { period_id } => assert_eq!(period_id, "2024-02"),
        other => panic!("expected PeriodClosed, got {other:?}"),
    }
    assert!(store.record("acme", "r-1").await.unwrap().is_none());
}

#[tokio::test]
async fn replay_of_applied_reconciliation_beats_closed_period() {
    let store = store();
    let record = cash("r-1", "acme", "d-1", "2024-02", 48_000);
    store.submit(&record).await.unwrap();

    // Back office closes the period, then the device retransmits because
    // the original ack never arrived. The replay must still drain.
    let mut policy = TenantPolicy::default();
    policy.close_period("2024-02");
    store.set_tenant_policy("acme", policy);

    let ack = store.submit(&record).await.unwrap();
    assert!(matches!(ack, PushAck::Duplicate { .. }));
}

// ==== Tenant isolation ====

#[tokio::test]
async fn record_id_is_bound_to_its_first_tenant() {
    let store = store();
    store.submit(&visit("r-1", "acme", "d-1")).await.unwrap();

    let ack = store.submit(&visit("r-1", "globex", "d-9")).await.unwrap();
    assert!(matches!(
        rejection_reason(&ack),
        RejectReason::TenantMismatch
    ));

    // Nothing leaked into the other tenant, and the owner is untouched.
    assert!(store.record("globex", "r-1").await.unwrap().is_none());
    let record = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(record.tenant_id, "acme");

    let page = store.pull("globex", "d-9", 0, 100).await.unwrap();
    assert!(page.records.is_empty());
}

// ==== Stock ledger ====

#[tokio::test]
async fn stock_movements_accumulate_across_records() {
    let store = store();
    store.submit(&stock("m-1", "acme", "d-1", 10.0)).await.unwrap();
    store.submit(&stock("m-2", "acme", "d-1", -4.0)).await.unwrap();
    store.submit(&stock("m-3", "acme", "d-2", 2.5)).await.unwrap();

    let total = store.stock_total("acme", "wh-1", "sku-9").await.unwrap();
    assert_eq!(total, 8.5);
}

#[tokio::test]
async fn late_stock_movement_version_still_counts() {
    let store = store();
    let v1 = stock("m-1", "acme", "d-1", 3.0);
    let v2 = v1.next_version(
        RecordPayload::StockMovement {
            warehouse_id: "wh-1".into(),
            product_id: "sku-9".into(),
            quantity_delta: 5.0,
            unit: StockUnit::Each,
        },
        2_000,
    );

    store.submit(&v2).await.unwrap();
    let ack = store.submit(&v1).await.unwrap();
    assert!(matches!(ack, PushAck::Accepted { .. }));

    // Both deltas land in the ledger; the newer payload stays representative.
    let total = store.stock_total("acme", "wh-1", "sku-9").await.unwrap();
    assert_eq!(total, 8.0);
    let record = store.record("acme", "m-1").await.unwrap().unwrap();
    assert_eq!(record.version, 2);
}

// ==== Server version monotonicity ====

#[tokio::test]
async fn server_version_only_moves_forward() {
    let store = store();
    let v1 = cash("r-1", "acme", "d-1", "2024-03", 48_000);
    let v2 = v1.next_version(
        RecordPayload::CashReconciliation {
            period_id: "2024-03".into(),
            counted_minor: 49_000,
            expected_minor: 50_000,
            currency: "AZN".into(),
        },
        2_000,
    );

    store.submit(&v1).await.unwrap();
    let after_v1 = store.record("acme", "r-1").await.unwrap().unwrap();
    store.submit(&v2).await.unwrap();
    let after_v2 = store.record("acme", "r-1").await.unwrap().unwrap();

    // Rejected and duplicate submissions leave it untouched.
    store.submit(&v1).await.unwrap();
    store.submit(&v2).await.unwrap();
    let after_replays = store.record("acme", "r-1").await.unwrap().unwrap();

    assert!(after_v2.server_version > after_v1.server_version);
    assert_eq!(after_replays.server_version, after_v2.server_version);
}

// ==== Pull pagination ====

#[tokio::test]
async fn pull_pages_through_the_change_stream() {
    let store = store();
    for i in 0..5 {
        store
            .submit(&visit(&format!("r-{i}"), "acme", "d-1"))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = 0;
    let mut pages = 0;
    loop {
        let page = store.pull("acme", "d-2", cursor, 2).await.unwrap();
        assert!(page.next_cursor >= cursor);
        seen.extend(page.records.iter().map(|r| r.record_id.clone()));
        cursor = page.next_cursor;
        pages += 1;
        if !page.has_more {
            break;
        }
    }

    assert_eq!(pages, 3);
    seen.sort();
    assert_eq!(seen, vec!["r-0", "r-1", "r-2", "r-3", "r-4"]);
    assert_eq!(store.device_cursor("acme", "d-2").await.unwrap(), cursor);
}

#[tokio::test]
async fn pull_dedupes_repeated_changes_to_one_record() {
    let store = store();
    let v1 = visit("r-1", "acme", "d-1");
    let v2 = v1.next_version(
        RecordPayload::Visit {
            outlet_id: "outlet-17".into(),
            latitude: 41.0,
            longitude: 50.0,
            accuracy_m: 3.0,
        },
        2_000,
    );
    store.submit(&v1).await.unwrap();
    store.submit(&v2).await.unwrap();
    store.submit(&visit("r-2", "acme", "d-1")).await.unwrap();

    let page = store.pull("acme", "d-2", 0, 100).await.unwrap();
    assert!(!page.has_more);
    assert_eq!(page.records.len(), 2);

    let r1 = page
        .records
        .iter()
        .find(|r| r.record_id == "r-1")
        .unwrap();
    assert_eq!(r1.version, 2);
}

// ==== Boundary validation ====

#[tokio::test]
async fn malformed_records_are_rejected_at_the_boundary() {
    let store = store();
    let mut bad = visit("r-1", "acme", "d-1");
    if let RecordPayload::Visit { latitude, .. } = &mut bad.payload {
        *latitude = 95.0;
    }

    let ack = store.submit(&bad).await.unwrap();
    assert!(matches!(
        rejection_reason(&ack),
        RejectReason::Invalid { .. }
    ));
    assert!(store.record("acme", "r-1").await.unwrap().is_none());
}

// ==== Batching and concurrency ====

#[tokio::test]
async fn batch_applies_versions_of_one_record_in_order() {
    let store = store();
    let v1 = visit("r-1", "acme", "d-1");
    let v2 = v1.next_version(
        RecordPayload::Visit {
            outlet_id: "outlet-17".into(),
            latitude: 40.6,
            longitude: 49.7,
            accuracy_m: 6.0,
        },
        2_000,
    );

    let acks = store
        .submit_batch(vec![v1, v2, visit("r-2", "acme", "d-1")])
        .await
        .unwrap();

    assert_eq!(acks.len(), 3);
    assert_eq!(acks[0].version(), 1);
    assert_eq!(accepted_server_version(&acks[0]), 1);
    assert_eq!(acks[1].version(), 2);
    assert_eq!(accepted_server_version(&acks[1]), 2);

    let record = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(record.version, 2);
}

#[tokio::test]
async fn concurrent_submissions_of_distinct_records_all_land() {
    let store = Arc::new(store());
    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .submit(&visit(&format!("r-{i}"), "acme", "d-1"))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let ack = handle.await.unwrap();
        assert!(matches!(ack, PushAck::Accepted { .. }));
    }

    let page = store.pull("acme", "d-2", 0, 100).await.unwrap();
    assert_eq!(page.records.len(), 16);
}

#[tokio::test]
async fn concurrent_versions_of_one_record_converge_to_the_highest() {
    let store = Arc::new(store());
    let base = visit("r-1", "acme", "d-1");

    let mut versions = Vec::new();
    let mut current = base;
    versions.push(current.clone());
    for step in 0..7u32 {
        current = current.next_version(
            RecordPayload::Visit {
                outlet_id: "outlet-17".into(),
                latitude: 40.0 + f64::from(step),
                longitude: 49.0,
                accuracy_m: 5.0,
            },
            2_000 + u64::from(step),
        );
        versions.push(current.clone());
    }

    let mut handles = Vec::new();
    for record in versions {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move { store.submit(&record).await.unwrap() }));
    }
    let mut accepted = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), PushAck::Accepted { .. }) {
            accepted += 1;
        }
    }

    // Whatever the interleaving, the highest version wins and at least one
    // submission lands.
    assert!(accepted >= 1);
    let record = store.record("acme", "r-1").await.unwrap().unwrap();
    assert_eq!(record.version, 8);
}
