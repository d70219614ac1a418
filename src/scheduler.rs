use crate::db::{self, Pool};
use crate::model::{PayoutRecord, PayoutStatus, PayoutUpdate};
use crate::origin::OriginSync;
use crate::providers::ProviderRegistry;
use crate::status;
use anyhow::Result;
use chrono::Utc;
use futures::future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Shared context for dispatching payouts: the provider adapters, the origin
/// synchronizer, and the per-call dispatch timeout. Intake holds this behind
/// an `Arc` so fire-and-forget scheduling tasks can own a handle.
pub struct Dispatch {
    pub providers: ProviderRegistry,
    pub origin: OriginSync,
    pub timeout: Duration,
}

impl Dispatch {
    pub fn new(providers: ProviderRegistry, origin: OriginSync, timeout: Duration) -> Self {
        Self {
            providers,
            origin,
            timeout,
        }
    }
}

/// Dispatch every payout of the batch that is still PENDING. Safe to invoke
/// again for the same batch: records are claimed with a conditional update,
/// so a payout that already left PENDING is skipped, and concurrent
/// invocations dispatch each record at most once.
///
/// Records are processed independently; one payout's failure is recorded on
/// that payout and never aborts its siblings. Only a failure of the batch
/// query itself is returned to the caller.
#[instrument(skip_all)]
pub async fn schedule_batch_payout_processing(
    pool: &Pool,
    dispatch: &Dispatch,
    batch_id: &str,
) -> Result<()> {
    let pending = db::payouts_by_batch_status(pool, batch_id, PayoutStatus::Pending).await?;
    if pending.is_empty() {
        debug!(batch_id, "no pending payouts for batch; nothing to do");
        return Ok(());
    }
    info!(batch_id, count = pending.len(), "dispatching batch payouts");

    let outcomes = future::join_all(
        pending
            .iter()
            .map(|record| dispatch_record(pool, dispatch, record)),
    )
    .await;

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    for (record, outcome) in pending.iter().zip(outcomes) {
        match outcome {
            Ok(Some(PayoutStatus::Completed)) => completed += 1,
            Ok(Some(_)) => failed += 1,
            Ok(None) => skipped += 1,
            Err(err) => {
                warn!(?err, batch_id, payout_id = %record.id, "payout dispatch errored");
                failed += 1;
            }
        }
    }
    info!(batch_id, completed, failed, skipped, "batch payout dispatch finished");
    Ok(())
}

/// Claim one payout and run it through its provider adapter. Returns the
/// terminal status reached, or `None` when the record was no longer PENDING.
async fn dispatch_record(
    pool: &Pool,
    dispatch: &Dispatch,
    record: &PayoutRecord,
) -> Result<Option<PayoutStatus>> {
    let Some(claimed) = status::claim_for_processing(pool, &record.id).await? else {
        debug!(payout_id = %record.id, "payout no longer pending; skipping");
        return Ok(None);
    };

    let Some(provider) = dispatch.providers.get(claimed.method) else {
        warn!(payout_id = %claimed.id, method = claimed.method.as_str(), "no payout provider registered");
        let updated = status::update_payout_status(
            pool,
            &dispatch.origin,
            &claimed,
            PayoutStatus::Failed,
            "payout dispatch failed",
            PayoutUpdate {
                failure_reason: Some(format!(
                    "no payout provider registered for {}",
                    claimed.method.as_str()
                )),
                ..Default::default()
            },
        )
        .await?;
        return Ok(Some(updated.status));
    };

    let updated = match tokio::time::timeout(dispatch.timeout, provider.execute(&claimed)).await {
        Ok(Ok(receipt)) => {
            status::update_payout_status(
                pool,
                &dispatch.origin,
                &claimed,
                PayoutStatus::Completed,
                "payout completed",
                PayoutUpdate {
                    provider_payout_id: receipt.provider_payout_id,
                    completion_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?
        }
        Ok(Err(err)) => {
            warn!(?err, payout_id = %claimed.id, "provider dispatch failed");
            status::update_payout_status(
                pool,
                &dispatch.origin,
                &claimed,
                PayoutStatus::Failed,
                "payout dispatch failed",
                PayoutUpdate {
                    failure_reason: Some(format!("{err:#}")),
                    ..Default::default()
                },
            )
            .await?
        }
        Err(_) => {
            warn!(payout_id = %claimed.id, timeout_secs = dispatch.timeout.as_secs(), "provider dispatch timed out");
            status::update_payout_status(
                pool,
                &dispatch.origin,
                &claimed,
                PayoutStatus::Failed,
                "payout dispatch timed out",
                PayoutUpdate {
                    failure_reason: Some(format!(
                        "payout dispatch timed out after {}s",
                        dispatch.timeout.as_secs()
                    )),
                    ..Default::default()
                },
            )
            .await?
        }
    };
    Ok(Some(updated.status))
}
