use std::sync::Arc;
use std::time::Duration;

use studio_core::AssetStore;
use tokio::sync::watch;
use tracing::{info, warn};

/// Deletes assets whose `retain_until` has lapsed (spec §4.8,
/// supplemented — see SPEC_FULL.md §2). Mirrors the lease-sweep and
/// DLQ-reprocessing loops elsewhere in this workspace: a bounded
/// `run_once` driven by an external `tokio::select!` loop.
pub struct RetentionSweeper {
    store: Arc<dyn AssetStore>,
    batch_size: usize,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn AssetStore>, batch_size: usize, interval: Duration) -> Self {
        Self {
            store,
            batch_size,
            interval,
        }
    }

    /// Deletes one batch of expired assets, returning how many were removed.
    pub async fn run_once(&self) -> usize {
        let now = chrono::Utc::now();
        let expired = match self.store.scan_expired(now, self.batch_size).await {
            Ok(expired) => expired,
            Err(err) => {
                warn!(error = %err, "retention scan failed");
                return 0;
            }
        };

        let mut deleted = 0;
        for asset in &expired {
            match self.store.delete(asset.id).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(asset_id = %asset.id, error = %err, "failed to delete expired asset"),
            }
        }
        if deleted > 0 {
            info!(deleted, "retention sweep removed expired assets");
        }
        deleted
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use studio_testing::InMemoryAssetStore;

    #[tokio::test]
    async fn run_once_deletes_only_assets_past_retention() {
        let store = Arc::new(InMemoryAssetStore::new("/data/assets"));
        let dyn_store: Arc<dyn AssetStore> = store.clone();

        let expired = dyn_store
            .put("user-1", studio_core::AssetKind::Video, vec![1, 2, 3], "video/mp4", ".mp4")
            .await
            .unwrap();
        dyn_store
            .set_retain_until(expired.id, chrono::Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        let kept = dyn_store
            .put("user-1", studio_core::AssetKind::Video, vec![4, 5, 6], "video/mp4", ".mp4")
            .await
            .unwrap();
        dyn_store
            .set_retain_until(kept.id, chrono::Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();

        let sweeper = RetentionSweeper::new(dyn_store.clone(), 10, Duration::from_secs(60));
        let deleted = sweeper.run_once().await;

        assert_eq!(deleted, 1);
        assert!(dyn_store.get(expired.id).await.unwrap().is_none());
        assert!(dyn_store.get(kept.id).await.unwrap().is_some());
    }
}
