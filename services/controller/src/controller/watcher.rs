//! Store event watcher.
//!
//! Maps store changes to the AppScaler keys that must be reconciled:
//! - AppScaler applied or deleted: that AppScaler
//! - Workload changed: every AppScaler targeting it
//!
//! AppScaler status writes are ignored, since they are the controller's own
//! output.

use std::sync::Arc;
use std::time::Duration;

use appscaler_id::ObjectKey;
use appscaler_reconcile::WorkQueue;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, trace, warn};

use super::shutdown_signaled;
use crate::api::ResourceKind;
use crate::store::{ChangeKind, ClusterStore, StoreEvent, StoreResult};

/// Feeds the work queue from store events and periodic resyncs.
#[derive(Clone)]
pub struct Watcher {
    store: Arc<dyn ClusterStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl Watcher {
    pub fn new(store: Arc<dyn ClusterStore>, queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { store, queue }
    }

    /// Dispatch events until the stream closes or shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<StoreEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting store watcher");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store watch lagged, resyncing");
                        self.resync_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Store watch closed");
                        break;
                    }
                },
                _ = shutdown_signaled(&mut shutdown) => break,
            }
        }

        debug!("Store watcher stopped");
    }

    /// Queue every AppScaler now and then on every `interval`.
    #[instrument(skip_all)]
    pub async fn run_resync(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.resync_logged().await,
                _ = shutdown_signaled(&mut shutdown) => break,
            }
        }

        debug!("Resync task stopped");
    }

    /// Queue the AppScalers affected by one event.
    pub async fn dispatch(&self, event: StoreEvent) {
        match (event.kind, event.change) {
            (ResourceKind::AppScaler, ChangeKind::StatusUpdated) => {
                trace!(scaler = %event.key, "Ignoring status update");
            }
            (ResourceKind::AppScaler, _) => {
                debug!(scaler = %event.key, change = ?event.change, "AppScaler changed");
                self.queue.add(event.key);
            }
            (ResourceKind::Workload, _) => match self.scalers_targeting(&event.key).await {
                Ok(scalers) => {
                    debug!(
                        workload = %event.key,
                        change = ?event.change,
                        scalers = scalers.len(),
                        "Workload changed"
                    );
                    for scaler in scalers {
                        self.queue.add(scaler);
                    }
                }
                Err(e) => {
                    warn!(workload = %event.key, error = %e, "Failed to map workload change");
                }
            },
        }
    }

    /// Queue every AppScaler. Returns how many were queued.
    pub async fn resync(&self) -> StoreResult<usize> {
        let scalers = self.store.list_scalers().await?;
        let count = scalers.len();
        for scaler in scalers {
            self.queue.add(scaler.metadata.key);
        }
        Ok(count)
    }

    async fn resync_logged(&self) {
        match self.resync().await {
            Ok(count) => debug!(scalers = count, "Resync queued AppScalers"),
            Err(e) => warn!(error = %e, "Resync failed"),
        }
    }

    async fn scalers_targeting(&self, workload: &ObjectKey) -> StoreResult<Vec<ObjectKey>> {
        Ok(self
            .store
            .list_scalers()
            .await?
            .into_iter()
            .filter(|scaler| scaler.targets(workload))
            .map(|scaler| scaler.metadata.key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AppScaler, Workload};
    use crate::store::MemoryStore;
    use appscaler_reconcile::BackoffPolicy;

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, Watcher) {
        let store = Arc::new(MemoryStore::new());
        store.apply_workload(Workload::new(key("web"), Some(1))).await;
        store
            .apply_scaler(AppScaler::new(key("a"), 2, vec![key("web")]))
            .await;
        store
            .apply_scaler(AppScaler::new(key("b"), 2, vec![key("api")]))
            .await;

        let queue = Arc::new(WorkQueue::new(BackoffPolicy::default()));
        let watcher = Watcher::new(store.clone(), queue);
        (store, watcher)
    }

    async fn drain(queue: &WorkQueue<ObjectKey>) -> Vec<ObjectKey> {
        let mut keys = Vec::new();
        while let Ok(Some(key)) =
            tokio::time::timeout(Duration::from_millis(20), queue.next()).await
        {
            queue.done(&key);
            keys.push(key);
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_workload_event_queues_owning_scalers() {
        let (_store, watcher) = setup().await;

        watcher
            .dispatch(StoreEvent {
                kind: ResourceKind::Workload,
                key: key("web"),
                change: ChangeKind::Applied,
            })
            .await;

        assert_eq!(drain(&watcher.queue).await, vec![key("a")]);
    }

    #[tokio::test]
    async fn test_status_update_is_ignored() {
        let (_store, watcher) = setup().await;

        watcher
            .dispatch(StoreEvent {
                kind: ResourceKind::AppScaler,
                key: key("a"),
                change: ChangeKind::StatusUpdated,
            })
            .await;

        assert!(watcher.queue.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_scaler_is_queued() {
        let (_store, watcher) = setup().await;

        watcher
            .dispatch(StoreEvent {
                kind: ResourceKind::AppScaler,
                key: key("a"),
                change: ChangeKind::Deleted,
            })
            .await;

        assert_eq!(drain(&watcher.queue).await, vec![key("a")]);
    }

    #[tokio::test]
    async fn test_resync_queues_everything() {
        let (_store, watcher) = setup().await;

        assert_eq!(watcher.resync().await.unwrap(), 2);
        assert_eq!(drain(&watcher.queue).await, vec![key("a"), key("b")]);
    }
}
