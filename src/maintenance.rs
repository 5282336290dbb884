use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::observability::COMPACTIONS_TOTAL;
use crate::store::JournaledStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the journal once it has grown by
/// `threshold` appends since the last compaction.
pub async fn run_compactor(store: Arc<JournaledStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns the number of live documents written, or `None` if nothing ran.
pub async fn compact_if_due(store: &JournaledStore, threshold: u64) -> Option<usize> {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        return None;
    }
    match store.compact().await {
        Ok(live) => {
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            info!("journal compacted: {appends} appends folded into {live} records");
            Some(live)
        }
        Err(e) => {
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "error").increment(1);
            tracing::error!("journal compaction failed: {e}");
            None
        }
    }
}
