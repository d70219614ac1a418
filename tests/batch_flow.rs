use anyhow::{anyhow, Result};
use payout_engine::db;
use payout_engine::intake;
use payout_engine::model::{PayoutMethod, PayoutRequest, PayoutStatus};
use payout_engine::origin::OriginSync;
use payout_engine::providers::{PayoutProvider, ProviderReceipt, ProviderRegistry};
use payout_engine::scheduler::{self, Dispatch};
use serde_json::Map;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct TestDb {
    pool: db::Pool,
    _dir: tempfile::TempDir,
}

async fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/payouts.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    TestDb { pool, _dir: dir }
}

#[derive(Clone, Default)]
struct RecordingProvider {
    responses: Arc<Mutex<VecDeque<Result<ProviderReceipt>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingProvider {
    fn with_responses(responses: Vec<Result<ProviderReceipt>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PayoutProvider for RecordingProvider {
    async fn execute(
        &self,
        record: &payout_engine::model::PayoutRecord,
    ) -> Result<ProviderReceipt> {
        self.calls.lock().await.push(record.id.clone());
        self.responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(ProviderReceipt {
                provider_payout_id: Some("provider-payout".into()),
            })
        })
    }
}

/// Never returns within any sane dispatch timeout.
struct HangingProvider;

#[async_trait::async_trait]
impl PayoutProvider for HangingProvider {
    async fn execute(
        &self,
        _record: &payout_engine::model::PayoutRecord,
    ) -> Result<ProviderReceipt> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ProviderReceipt::default())
    }
}

fn request(
    amount: i64,
    method: PayoutMethod,
    target: &str,
    employee_id: &str,
    reference_id: &str,
    reference_type: &str,
) -> PayoutRequest {
    PayoutRequest {
        amount,
        description: "dividend payout".into(),
        method,
        target_identifier: target.into(),
        employee_id: employee_id.into(),
        tenant_id: "tenant-1".into(),
        reference_id: reference_id.into(),
        reference_type: reference_type.into(),
        metadata: Map::new(),
    }
}

fn dispatch_with(
    line_pay: Arc<dyn PayoutProvider>,
    bank: Arc<dyn PayoutProvider>,
    timeout: Duration,
) -> Arc<Dispatch> {
    let mut registry = ProviderRegistry::new();
    registry.register(PayoutMethod::LinePay, line_pay);
    registry.register(PayoutMethod::BankTransfer, bank);
    Arc::new(Dispatch::new(registry, OriginSync::default(), timeout))
}

async fn wait_until_terminal(pool: &db::Pool, ids: &[String]) {
    for _ in 0..200 {
        let mut all_terminal = true;
        for id in ids {
            let record = db::get_payout(pool, id).await.unwrap().unwrap();
            if !record.status.is_terminal() {
                all_terminal = false;
                break;
            }
        }
        if all_terminal {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("payouts never reached a terminal status");
}

#[tokio::test]
async fn end_to_end_batch_completes_and_syncs_origins() {
    let test_db = setup_db().await;
    let pool = &test_db.pool;
    let line_pay = RecordingProvider::with_responses(vec![Ok(ProviderReceipt {
        provider_payout_id: Some("line-1".into()),
    })]);
    let bank = RecordingProvider::with_responses(vec![Ok(ProviderReceipt {
        provider_payout_id: Some("transfer-1".into()),
    })]);
    let dispatch = dispatch_with(
        Arc::new(line_pay.clone()),
        Arc::new(bank.clone()),
        Duration::from_secs(5),
    );

    let batch = intake::process_batch_payout(
        pool,
        &dispatch,
        &[
            request(
                1000,
                PayoutMethod::LinePay,
                "line-user-1",
                "emp-1",
                "snap-1/payout-1",
                "dividend",
            ),
            request(
                2000,
                PayoutMethod::BankTransfer,
                "012:3456789",
                "emp-2",
                "snap-1/payout-2",
                "dividend",
            ),
        ],
    )
    .await
    .unwrap();

    assert_eq!(batch.records.len(), 2);
    for record in &batch.records {
        assert_eq!(record.status, PayoutStatus::Pending);
        assert_eq!(record.status_history.len(), 1);
    }

    let ids: Vec<String> = batch.records.iter().map(|r| r.id.clone()).collect();
    wait_until_terminal(pool, &ids).await;

    for id in &ids {
        let record = db::get_payout(pool, id).await.unwrap().unwrap();
        assert_eq!(record.status, PayoutStatus::Completed);
        assert_eq!(record.status_history.len(), 3);
        assert_eq!(record.status_history[1].status, PayoutStatus::Processing);
        assert_eq!(record.status_history[2].status, PayoutStatus::Completed);
        assert!(record.processing_time.is_some());
        assert!(record.completion_time.is_some());
        assert!(record.provider_payout_id.is_some());
        assert!(record.updated_at > record.created_at);
    }

    assert_eq!(line_pay.calls().await.len(), 1);
    assert_eq!(bank.calls().await.len(), 1);

    for employee in ["emp-1", "emp-2"] {
        let path = format!("dividend_snapshots/snap-1/equity_payouts/{employee}");
        let doc = db::get_document(pool, &path)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("origin document missing for {employee}"));
        assert_eq!(doc.data["status"], "completed");
        assert_eq!(doc.data["payout_status"], "completed");
        assert!(doc.data["payout_id"].is_string());
    }
}

#[tokio::test]
async fn provider_failure_is_recorded_and_spares_siblings() {
    let test_db = setup_db().await;
    let pool = &test_db.pool;
    let line_pay = RecordingProvider::default();
    let bank =
        RecordingProvider::with_responses(vec![Err(anyhow!("insufficient settlement balance"))]);
    let dispatch = dispatch_with(
        Arc::new(line_pay.clone()),
        Arc::new(bank.clone()),
        Duration::from_secs(5),
    );

    let batch = intake::process_batch_payout(
        pool,
        &dispatch,
        &[
            request(
                1000,
                PayoutMethod::LinePay,
                "line-user-1",
                "emp-1",
                "snap-1/payout-1",
                "dividend",
            ),
            request(
                2000,
                PayoutMethod::BankTransfer,
                "012:3456789",
                "emp-2",
                "snap-1/payout-2",
                "dividend",
            ),
        ],
    )
    .await
    .unwrap();
    let ids: Vec<String> = batch.records.iter().map(|r| r.id.clone()).collect();
    wait_until_terminal(pool, &ids).await;

    let completed = db::get_payout(pool, &ids[0]).await.unwrap().unwrap();
    assert_eq!(completed.status, PayoutStatus::Completed);
    assert!(completed.failure_reason.is_none());

    let failed = db::get_payout(pool, &ids[1]).await.unwrap().unwrap();
    assert_eq!(failed.status, PayoutStatus::Failed);
    assert!(failed
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("insufficient settlement balance"));
    assert_eq!(failed.status_history.len(), 3);
    assert_eq!(failed.status_history[2].status, PayoutStatus::Failed);

    // The failed payout still reports back to its origin record.
    let doc = db::get_document(pool, "dividend_snapshots/snap-1/equity_payouts/emp-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.data["payout_status"], "failed");
}

#[tokio::test]
async fn scheduling_unknown_batch_is_a_noop() {
    let test_db = setup_db().await;
    let pool = &test_db.pool;
    let dispatch = dispatch_with(
        Arc::new(RecordingProvider::default()),
        Arc::new(RecordingProvider::default()),
        Duration::from_secs(5),
    );

    scheduler::schedule_batch_payout_processing(pool, &dispatch, "no-such-batch")
        .await
        .unwrap();

    let payouts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payouts")
        .fetch_one(pool)
        .await
        .unwrap();
    let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payout_status_history")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!((payouts, history), (0, 0));
}

#[tokio::test]
async fn rescheduling_a_finished_batch_changes_nothing() {
    let test_db = setup_db().await;
    let pool = &test_db.pool;
    let line_pay = RecordingProvider::default();
    let dispatch = dispatch_with(
        Arc::new(line_pay.clone()),
        Arc::new(RecordingProvider::default()),
        Duration::from_secs(5),
    );

    let batch = intake::process_batch_payout(
        pool,
        &dispatch,
        &[request(
            500,
            PayoutMethod::LinePay,
            "line-user-1",
            "emp-1",
            "snap-1/payout-1",
            "dividend",
        )],
    )
    .await
    .unwrap();
    let ids: Vec<String> = batch.records.iter().map(|r| r.id.clone()).collect();
    wait_until_terminal(pool, &ids).await;

    scheduler::schedule_batch_payout_processing(pool, &dispatch, &batch.batch_id)
        .await
        .unwrap();

    assert_eq!(line_pay.calls().await.len(), 1);
    let record = db::get_payout(pool, &ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status_history.len(), 3);
}

#[tokio::test]
async fn hung_provider_times_out_as_failed() {
    let test_db = setup_db().await;
    let pool = &test_db.pool;
    let dispatch = dispatch_with(
        Arc::new(HangingProvider),
        Arc::new(RecordingProvider::default()),
        Duration::from_millis(100),
    );

    let batch = intake::process_batch_payout(
        pool,
        &dispatch,
        &[request(
            700,
            PayoutMethod::LinePay,
            "line-user-1",
            "emp-1",
            "snap-1/payout-1",
            "dividend",
        )],
    )
    .await
    .unwrap();
    let ids: Vec<String> = batch.records.iter().map(|r| r.id.clone()).collect();
    wait_until_terminal(pool, &ids).await;

    let record = db::get_payout(pool, &ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, PayoutStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("timed out"));
}

#[tokio::test]
async fn unmapped_reference_type_completes_without_origin_write() {
    let test_db = setup_db().await;
    let pool = &test_db.pool;
    let dispatch = dispatch_with(
        Arc::new(RecordingProvider::default()),
        Arc::new(RecordingProvider::default()),
        Duration::from_secs(5),
    );

    let batch = intake::process_batch_payout(
        pool,
        &dispatch,
        &[request(
            900,
            PayoutMethod::LinePay,
            "line-user-1",
            "emp-1",
            "reward-1",
            "loyalty_reward",
        )],
    )
    .await
    .unwrap();
    let ids: Vec<String> = batch.records.iter().map(|r| r.id.clone()).collect();
    wait_until_terminal(pool, &ids).await;

    let record = db::get_payout(pool, &ids[0]).await.unwrap().unwrap();
    assert_eq!(record.status, PayoutStatus::Completed);

    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(documents, 0);
}
