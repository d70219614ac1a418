use crate::db::{self, Pool};
use crate::model::{PayoutMethod, PayoutRecord, PayoutRequest, PayoutStatus, StatusEntry};
use crate::scheduler::{self, Dispatch};
use anyhow::{bail, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// History note recorded when a payout record is created.
pub const INTAKE_NOTE: &str = "initializing payout request";

// bank-code:account-number
static BANK_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{3,4}:\d{6,16}$").expect("valid bank target pattern"));

/// What one intake call produced: the shared batch id and the created
/// records, so the caller can display and track them immediately.
#[derive(Debug)]
pub struct BatchIntake {
    pub batch_id: String,
    pub records: Vec<PayoutRecord>,
}

/// Accept a group of payout requests: validate them, persist one PENDING
/// record per request under a fresh batch id, and kick off asynchronous
/// batch processing. The spawned scheduling task is fire-and-forget; its
/// failure is logged and never fails the intake call.
#[instrument(skip_all)]
pub async fn process_batch_payout(
    pool: &Pool,
    dispatch: &Arc<Dispatch>,
    requests: &[PayoutRequest],
) -> Result<BatchIntake> {
    if requests.is_empty() {
        bail!("payout requests cannot be empty");
    }
    for request in requests {
        validate_request(request)?;
    }

    let batch_id = Uuid::new_v4().to_string();
    let mut records = Vec::with_capacity(requests.len());
    let mut tx = pool.begin().await?;
    for request in requests {
        let record = new_record(&batch_id, request);
        db::insert_payout_tx(&mut tx, &record).await?;
        records.push(record);
    }
    tx.commit().await?;
    info!(batch_id = %batch_id, count = records.len(), "payout batch accepted");

    let worker_pool = pool.clone();
    let dispatch = dispatch.clone();
    let spawned_batch_id = batch_id.clone();
    tokio::spawn(async move {
        if let Err(err) =
            scheduler::schedule_batch_payout_processing(&worker_pool, &dispatch, &spawned_batch_id)
                .await
        {
            error!(?err, batch_id = %spawned_batch_id, "async batch payout scheduling failed");
        }
    });

    Ok(BatchIntake { batch_id, records })
}

fn new_record(batch_id: &str, request: &PayoutRequest) -> PayoutRecord {
    let now = Utc::now();
    PayoutRecord {
        id: Uuid::new_v4().to_string(),
        batch_id: batch_id.to_string(),
        status: PayoutStatus::Pending,
        method: request.method,
        amount: request.amount,
        description: request.description.clone(),
        target_identifier: request.target_identifier.clone(),
        employee_id: request.employee_id.clone(),
        tenant_id: request.tenant_id.clone(),
        reference_id: request.reference_id.clone(),
        reference_type: request.reference_type.clone(),
        provider_payout_id: None,
        completion_time: None,
        failure_reason: None,
        processing_time: None,
        metadata: request.metadata.clone(),
        status_history: vec![StatusEntry {
            status: PayoutStatus::Pending,
            at: now,
            note: INTAKE_NOTE.to_string(),
        }],
        created_at: now,
        updated_at: now,
    }
}

fn validate_request(request: &PayoutRequest) -> Result<()> {
    if request.amount <= 0 {
        bail!("payout amount must be positive, got {}", request.amount);
    }
    if request.method == PayoutMethod::BankTransfer
        && !BANK_TARGET.is_match(&request.target_identifier)
    {
        bail!(
            "invalid bank transfer target {:?}: expected bank-code:account-number",
            request.target_identifier
        );
    }
    Ok(())
}
