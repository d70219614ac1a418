use crate::db::{self, Pool};
use crate::model::PayoutRecord;
use serde_json::{json, Map};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// Derives the document path of a payout's origin record, or `None` when the
/// reference cannot be resolved.
pub type PathBuilder = fn(&PayoutRecord) -> Option<String>;

/// Writes terminal payout status back to the business record the payout was
/// created for (e.g. a dividend snapshot entry). Mappings are registered per
/// `reference_type`, so new origin kinds plug in without touching the status
/// engine.
///
/// Synchronization is a best-effort side channel: the payout's own status is
/// already durable by the time this runs, so misses are logged and swallowed.
pub struct OriginSync {
    routes: HashMap<String, PathBuilder>,
}

impl Default for OriginSync {
    fn default() -> Self {
        let mut sync = Self::empty();
        sync.register("dividend", dividend_payout_path);
        sync
    }
}

impl OriginSync {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, reference_type: &str, builder: PathBuilder) {
        self.routes.insert(reference_type.to_string(), builder);
    }

    #[instrument(skip_all)]
    pub async fn update_original_record_status(
        &self,
        pool: &Pool,
        record: &PayoutRecord,
        status_label: &str,
    ) {
        let Some(builder) = self.routes.get(record.reference_type.as_str()) else {
            debug!(
                reference_type = %record.reference_type,
                payout_id = %record.id,
                "no origin mapping for reference type; skipping sync"
            );
            return;
        };
        let Some(path) = builder(record) else {
            warn!(
                reference_type = %record.reference_type,
                reference_id = %record.reference_id,
                payout_id = %record.id,
                "could not resolve origin record path; skipping sync"
            );
            return;
        };

        let mut fields = Map::new();
        fields.insert("status".into(), json!(status_label));
        fields.insert("payout_id".into(), json!(record.id));
        fields.insert("payout_status".into(), json!(status_label));
        if let Err(err) = db::merge_document(pool, &path, &fields).await {
            warn!(?err, path = %path, payout_id = %record.id, "origin record sync failed");
        } else {
            debug!(path = %path, payout_id = %record.id, status = status_label, "origin record synced");
        }
    }
}

/// Dividend payouts reference a snapshot line item as
/// `<snapshot_id>/<payout_entry>`; the origin document lives at
/// `dividend_snapshots/<snapshot_id>/equity_payouts/<employee_id>`.
fn dividend_payout_path(record: &PayoutRecord) -> Option<String> {
    let snapshot_id = record
        .reference_id
        .split('/')
        .next()
        .filter(|s| !s.is_empty())?;
    if record.employee_id.is_empty() {
        return None;
    }
    Some(format!(
        "dividend_snapshots/{}/equity_payouts/{}",
        snapshot_id, record.employee_id
    ))
}
