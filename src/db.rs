use crate::model::{PayoutRecord, PayoutStatus, PayoutUpdate, StatusEntry};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, ensure the parent directory exists and the
/// database file may be created, so a fresh deployment can open its store.
/// In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }
    if let Some(parent) = std::path::Path::new(path_part).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let mut rebuilt = format!("sqlite://{path_part}");
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// `updated_at` must advance strictly on every mutation. Wall clocks can
/// return the same instant twice, so nudge past the previous value if needed.
pub fn monotonic_now(prev: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match prev {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

fn row_to_payout(row: &SqliteRow) -> Result<PayoutRecord> {
    let status: String = row.get("status");
    let method: String = row.get("method");
    let metadata: String = row.get("metadata");
    Ok(PayoutRecord {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        status: status.parse()?,
        method: method.parse()?,
        amount: row.get("amount"),
        description: row.get("description"),
        target_identifier: row.get("target_identifier"),
        employee_id: row.get("employee_id"),
        tenant_id: row.get("tenant_id"),
        reference_id: row.get("reference_id"),
        reference_type: row.get("reference_type"),
        provider_payout_id: row.get("provider_payout_id"),
        completion_time: row.get("completion_time"),
        failure_reason: row.get("failure_reason"),
        processing_time: row.get("processing_time"),
        metadata: serde_json::from_str(&metadata)?,
        status_history: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Insert a freshly created payout inside an intake transaction, together
/// with its initial history entry.
pub async fn insert_payout_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record: &PayoutRecord,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO payouts (id, batch_id, status, method, amount, description, \
         target_identifier, employee_id, tenant_id, reference_id, reference_type, \
         metadata, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.batch_id)
    .bind(record.status.as_str())
    .bind(record.method.as_str())
    .bind(record.amount)
    .bind(&record.description)
    .bind(&record.target_identifier)
    .bind(&record.employee_id)
    .bind(&record.tenant_id)
    .bind(&record.reference_id)
    .bind(&record.reference_type)
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;

    for entry in &record.status_history {
        append_history_tx(tx, &record.id, entry).await?;
    }
    Ok(())
}

async fn append_history_tx(
    tx: &mut Transaction<'_, Sqlite>,
    payout_id: &str,
    entry: &StatusEntry,
) -> Result<()> {
    sqlx::query("INSERT INTO payout_status_history (payout_id, status, at, note) VALUES (?, ?, ?, ?)")
        .bind(payout_id)
        .bind(entry.status.as_str())
        .bind(entry.at)
        .bind(&entry.note)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn status_history(pool: &Pool, payout_id: &str) -> Result<Vec<StatusEntry>> {
    let rows = sqlx::query("SELECT status, at, note FROM payout_status_history WHERE payout_id = ? ORDER BY id ASC")
        .bind(payout_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            let status: String = row.get("status");
            Ok(StatusEntry {
                status: status.parse()?,
                at: row.get("at"),
                note: row.get("note"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn get_payout(pool: &Pool, id: &str) -> Result<Option<PayoutRecord>> {
    let row = sqlx::query("SELECT * FROM payouts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut record = row_to_payout(&row)?;
    record.status_history = status_history(pool, id).await?;
    Ok(Some(record))
}

#[instrument(skip_all)]
pub async fn payouts_by_batch_status(
    pool: &Pool,
    batch_id: &str,
    status: PayoutStatus,
) -> Result<Vec<PayoutRecord>> {
    let rows = sqlx::query("SELECT * FROM payouts WHERE batch_id = ? AND status = ? ORDER BY created_at ASC, id ASC")
        .bind(batch_id)
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut record = row_to_payout(row)?;
        record.status_history = status_history(pool, &record.id).await?;
        records.push(record);
    }
    Ok(records)
}

/// Batch ids that still have at least one PENDING payout. Used by the worker
/// to find unfinished work after a restart.
pub async fn batches_with_pending(pool: &Pool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT DISTINCT batch_id FROM payouts WHERE status = ? ORDER BY batch_id")
        .bind(PayoutStatus::Pending.as_str())
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Conditional PENDING → PROCESSING transition. Returns `None` when the
/// record was not in PENDING anymore (a concurrent scheduler got there
/// first), so each payout is dispatched at most once.
#[instrument(skip_all)]
pub async fn mark_processing_if_pending(
    pool: &Pool,
    id: &str,
    note: &str,
) -> Result<Option<PayoutRecord>> {
    // The transaction's first statement must be the write; a read-first
    // transaction can fail with a stale snapshot under a concurrent writer.
    // Only the status engine moves records out of PENDING, so `prev` is
    // current whenever the conditional claim below matches.
    let prev: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT updated_at FROM payouts WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    let Some(prev) = prev else {
        return Err(anyhow!("payout record not found: {id}"));
    };
    let now = monotonic_now(Some(prev));
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE payouts SET status = ?, processing_time = ?, updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(PayoutStatus::Processing.as_str())
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(PayoutStatus::Pending.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Ok(None);
    }
    append_history_tx(
        &mut tx,
        id,
        &StatusEntry {
            status: PayoutStatus::Processing,
            at: now,
            note: note.to_string(),
        },
    )
    .await?;
    tx.commit().await?;
    get_payout(pool, id).await
}

/// Apply a status transition: set the new status, merge the update's fields,
/// advance `updated_at` strictly, and append exactly one history entry.
#[instrument(skip_all)]
pub async fn apply_status_change(
    pool: &Pool,
    record: &PayoutRecord,
    new_status: PayoutStatus,
    note: &str,
    update: &PayoutUpdate,
) -> Result<PayoutRecord> {
    let now = monotonic_now(Some(record.updated_at));
    let mut metadata = record.metadata.clone();
    for (key, value) in &update.extra {
        metadata.insert(key.clone(), value.clone());
    }
    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        "UPDATE payouts SET status = ?, \
         provider_payout_id = COALESCE(?, provider_payout_id), \
         completion_time = COALESCE(?, completion_time), \
         failure_reason = COALESCE(?, failure_reason), \
         processing_time = COALESCE(?, processing_time), \
         metadata = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(new_status.as_str())
    .bind(&update.provider_payout_id)
    .bind(update.completion_time)
    .bind(&update.failure_reason)
    .bind(update.processing_time)
    .bind(serde_json::to_string(&metadata)?)
    .bind(now)
    .bind(&record.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!("payout record not found: {}", record.id));
    }
    append_history_tx(
        &mut tx,
        &record.id,
        &StatusEntry {
            status: new_status,
            at: now,
            note: note.to_string(),
        },
    )
    .await?;
    tx.commit().await?;
    get_payout(pool, &record.id)
        .await?
        .ok_or_else(|| anyhow!("payout record not found: {}", record.id))
}

/// A document owned by one of the surrounding back-office modules (dividend
/// snapshots and the like), addressed by slash-separated path.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub data: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

#[instrument(skip_all)]
pub async fn get_document(pool: &Pool, path: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT path, data, updated_at FROM documents WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let data: String = row.get("data");
    Ok(Some(Document {
        path: row.get("path"),
        data: serde_json::from_str(&data)?,
        updated_at: row.get("updated_at"),
    }))
}

/// Shallow-merge `fields` into the document at `path`, creating it if absent.
/// The document's `updated_at` advances strictly past its previous value.
#[instrument(skip_all)]
pub async fn merge_document(pool: &Pool, path: &str, fields: &Map<String, Value>) -> Result<()> {
    let existing = get_document(pool, path).await?;
    let (mut data, prev) = match existing {
        Some(doc) => (doc.data, Some(doc.updated_at)),
        None => (Map::new(), None),
    };
    for (key, value) in fields {
        data.insert(key.clone(), value.clone());
    }
    let now = monotonic_now(prev);
    sqlx::query(
        "INSERT INTO documents (path, data, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(path) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
    )
    .bind(path)
    .bind(serde_json::to_string(&data)?)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
