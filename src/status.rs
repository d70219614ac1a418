use crate::db::{self, Pool};
use crate::model::{PayoutRecord, PayoutStatus, PayoutUpdate};
use crate::origin::OriginSync;
use anyhow::Result;
use thiserror::Error;
use tracing::{info, instrument};

/// History note recorded when a payout is claimed for dispatch.
pub const PROCESSING_NOTE: &str = "processing payout started";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("payout record not found: {0}")]
    NotFound(String),
    #[error("payout {id} is already {current} and cannot transition to {requested}")]
    TerminalTransition {
        id: String,
        current: &'static str,
        requested: &'static str,
    },
}

/// A payout id to resolve from the store, or an already-loaded record.
#[derive(Debug)]
pub enum PayoutRef {
    Id(String),
    Record(Box<PayoutRecord>),
}

impl From<&str> for PayoutRef {
    fn from(id: &str) -> Self {
        PayoutRef::Id(id.to_string())
    }
}

impl From<String> for PayoutRef {
    fn from(id: String) -> Self {
        PayoutRef::Id(id)
    }
}

impl From<PayoutRecord> for PayoutRef {
    fn from(record: PayoutRecord) -> Self {
        PayoutRef::Record(Box::new(record))
    }
}

impl From<&PayoutRecord> for PayoutRef {
    fn from(record: &PayoutRecord) -> Self {
        PayoutRef::Record(Box::new(record.clone()))
    }
}

async fn resolve(pool: &Pool, payout: PayoutRef) -> Result<PayoutRecord> {
    match payout {
        PayoutRef::Record(record) => Ok(*record),
        PayoutRef::Id(id) => {
            let Some(record) = db::get_payout(pool, &id).await? else {
                return Err(StatusError::NotFound(id).into());
            };
            Ok(record)
        }
    }
}

/// The single authority for payout mutation. Appends one history entry,
/// merges the update's fields, and advances `updated_at` strictly. When the
/// new status is terminal, the origin record is synchronized after the
/// payout's own update has committed, so a sync failure never loses the
/// transition.
#[instrument(skip_all)]
pub async fn update_payout_status(
    pool: &Pool,
    origin: &OriginSync,
    payout: impl Into<PayoutRef>,
    new_status: PayoutStatus,
    note: &str,
    update: PayoutUpdate,
) -> Result<PayoutRecord> {
    let record = resolve(pool, payout.into()).await?;
    if record.status.is_terminal() {
        return Err(StatusError::TerminalTransition {
            id: record.id,
            current: record.status.as_str(),
            requested: new_status.as_str(),
        }
        .into());
    }

    let updated = db::apply_status_change(pool, &record, new_status, note, &update).await?;
    info!(
        payout_id = %updated.id,
        from = record.status.as_str(),
        to = new_status.as_str(),
        "payout status updated"
    );

    if let Some(label) = new_status.terminal_label() {
        origin
            .update_original_record_status(pool, &updated, label)
            .await;
    }
    Ok(updated)
}

/// Atomically move a PENDING payout to PROCESSING. Returns `None` when
/// another scheduler already took the record, which makes concurrent
/// scheduling of the same batch safe.
pub async fn claim_for_processing(pool: &Pool, id: &str) -> Result<Option<PayoutRecord>> {
    db::mark_processing_if_pending(pool, id, PROCESSING_NOTE).await
}
