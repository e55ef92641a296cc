mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use stk_api::database::TransactionStore;
use stk_api::errors::AppError;
use stk_api::models::stk_transaction::TransactionKey;
use stk_api::models::StkStatus;
use stk_api::workers::{Reconciler, ReconcilerConfig};

use common::{success_callback, Harness, QueryScript};

fn reconciler(h: &Harness, page_size: i64, concurrency: usize) -> Reconciler {
    Reconciler::new(
        h.service.clone(),
        ReconcilerConfig {
            warmup: Duration::ZERO,
            page_size,
            concurrency,
            system_id_prefix: "SYS".into(),
            ..ReconcilerConfig::default()
        },
    )
}

async fn age(h: &Harness, id: i64) {
    h.store
        .set_created_at(id, Utc::now() - ChronoDuration::minutes(30))
        .await;
}

#[tokio::test]
async fn stale_transaction_is_resolved_by_status_query() {
    let h = Harness::new();
    let id = h.accepted("0712345678", "ws_1").await;
    age(&h, id).await;

    let updated = reconciler(&h, 1000, 5).reconcile_cycle().await.unwrap();
    assert_eq!(updated, 1);

    let tx = h.store.get(&TransactionKey::Id(id)).await.unwrap().unwrap();
    assert_eq!(tx.stk_status, StkStatus::ResultSuccess);
    assert!(tx.succeeded);
    let receipt = tx.mpesa_receipt_id.unwrap();
    assert!(receipt.starts_with("SYS_"));
    assert!(receipt.ends_with("_m-ws_1"));

    let query = h.api.query_requests.lock().unwrap()[0].clone();
    assert_eq!(query.checkout_request_id, "ws_1");
    assert_eq!(query.business_short_code, "174379");
}

#[tokio::test]
async fn cancelled_payment_resolves_to_result_failed_without_receipt() {
    let h = Harness::new();
    let id = h.accepted("0712345678", "ws_1").await;
    age(&h, id).await;
    h.api.script_query("ws_1", QueryScript::Cancelled);

    reconciler(&h, 1000, 5).reconcile_cycle().await.unwrap();

    let tx = h.store.get(&TransactionKey::Id(id)).await.unwrap().unwrap();
    assert_eq!(tx.stk_status, StkStatus::ResultFailed);
    assert!(!tx.succeeded);
    assert!(tx.mpesa_receipt_id.is_none());
    assert_eq!(tx.result_code.as_deref(), Some("1032"));
}

#[tokio::test]
async fn fresh_and_completed_transactions_are_left_alone() {
    let h = Harness::new();
    let fresh = h.accepted("0712345678", "ws_fresh").await;
    let done = h.accepted("0712345679", "ws_done").await;
    age(&h, done).await;
    h.service
        .ingest_callback(success_callback("ws_done", "R1"))
        .await
        .unwrap();

    let updated = reconciler(&h, 1000, 5).reconcile_cycle().await.unwrap();
    assert_eq!(updated, 0);
    assert_eq!(h.api.query_count(), 0);

    let fresh = h.store.get(&TransactionKey::Id(fresh)).await.unwrap().unwrap();
    assert_eq!(fresh.stk_status, StkStatus::RequestSuccess);
    let done = h.store.get(&TransactionKey::Id(done)).await.unwrap().unwrap();
    assert_eq!(done.stk_status, StkStatus::StkSuccess);
    assert_eq!(done.mpesa_receipt_id.as_deref(), Some("R1"));
}

#[tokio::test]
async fn empty_credential_aborts_the_cycle() {
    let h = Harness::new();
    let id = h.accepted("0712345678", "ws_1").await;
    age(&h, id).await;
    h.credentials.set_access_token(String::new());

    let err = reconciler(&h, 1000, 5).reconcile_cycle().await.unwrap_err();
    assert!(matches!(err, AppError::ServiceUnavailable(_)));
    assert_eq!(h.api.query_count(), 0);
}

#[tokio::test]
async fn pages_through_every_record_with_bounded_concurrency() {
    let h = Harness::new();
    for i in 0..23 {
        let id = h.accepted("0712345678", &format!("ws_{}", i)).await;
        age(&h, id).await;
    }
    h.api.set_query_delay(Duration::from_millis(20));

    let updated = reconciler(&h, 5, 5).reconcile_cycle().await.unwrap();

    assert_eq!(updated, 23);
    assert_eq!(h.api.query_count(), 23);
    assert!(h.api.peak_in_flight() <= 5);
    assert!(h
        .store
        .all()
        .await
        .iter()
        .all(|tx| tx.stk_status == StkStatus::ResultSuccess));

    let mut checkouts: Vec<String> = h
        .api
        .query_requests
        .lock()
        .unwrap()
        .iter()
        .map(|q| q.checkout_request_id.clone())
        .collect();
    checkouts.sort();
    checkouts.dedup();
    assert_eq!(checkouts.len(), 23);
}

#[tokio::test]
async fn failed_queries_are_not_counted_and_stay_pending() {
    let h = Harness::new();
    let ok = h.accepted("0712345678", "ws_ok").await;
    let flaky = h.accepted("0712345679", "ws_flaky").await;
    age(&h, ok).await;
    age(&h, flaky).await;
    h.api.script_query("ws_flaky", QueryScript::Error);

    let updated = reconciler(&h, 1000, 5).reconcile_cycle().await.unwrap();
    assert_eq!(updated, 1);

    let flaky = h.store.get(&TransactionKey::Id(flaky)).await.unwrap().unwrap();
    assert_eq!(flaky.stk_status, StkStatus::RequestSuccess);
}

#[tokio::test]
async fn callback_after_poll_converges_on_one_record() {
    let h = Harness::new();
    let id = h.accepted("0712345678", "ws_1").await;
    age(&h, id).await;

    reconciler(&h, 1000, 5).reconcile_cycle().await.unwrap();
    let polled = h.store.get(&TransactionKey::Id(id)).await.unwrap().unwrap();
    assert_eq!(polled.stk_status, StkStatus::ResultSuccess);
    assert!(polled.mpesa_receipt_id.as_deref().unwrap().starts_with("SYS_"));

    let outcome = h
        .service
        .ingest_callback(success_callback("ws_1", "R1"))
        .await
        .unwrap();

    assert_eq!(outcome.transaction.id, id);
    assert_eq!(outcome.transaction.stk_status, StkStatus::StkSuccess);
    assert_eq!(outcome.transaction.mpesa_receipt_id.as_deref(), Some("R1"));
    assert_eq!(h.store.all().await.len(), 1);
}

#[tokio::test]
async fn poll_landing_after_callback_keeps_the_real_receipt() {
    let h = Harness::new();
    let id = h.accepted("0712345678", "ws_1").await;
    age(&h, id).await;
    h.api.set_query_delay(Duration::from_millis(100));

    let cycle = reconciler(&h, 1000, 5);
    let running = tokio::spawn(async move { cycle.reconcile_cycle().await });

    // The callback lands while the status query is still in flight.
    while h.api.query_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.service
        .ingest_callback(success_callback("ws_1", "R1"))
        .await
        .unwrap();
    running.await.unwrap().unwrap();

    let tx = h.store.get(&TransactionKey::Id(id)).await.unwrap().unwrap();
    assert_eq!(tx.stk_status, StkStatus::StkSuccess);
    assert_eq!(tx.mpesa_receipt_id.as_deref(), Some("R1"));
    assert_eq!(h.store.all().await.len(), 1);
}
