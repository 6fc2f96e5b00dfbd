//! AppScaler controller.
//!
//! The controller wires the store to the reconciler:
//! - The watcher turns store events into AppScaler keys on the work queue
//! - The resync task periodically queues every AppScaler
//! - Workers pull keys, run the reconciler, and requeue from the outcome
//!
//! The queue guarantees at most one pass per key at a time, so the
//! reconciler itself needs no locking.

mod reconciler;
mod watcher;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use appscaler_id::ObjectKey;
use appscaler_reconcile::{BackoffPolicy, WorkQueue};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, Span};

use crate::config::Config;
use crate::store::ClusterStore;

pub use reconciler::{replicas_drifted, AppScalerReconciler, ReconcileError};
pub use watcher::Watcher;
pub use worker::Worker;

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Requeue delay after a successful pass.
    pub requeue_interval: Duration,

    /// Interval between full resyncs.
    pub resync_interval: Duration,

    /// Retry backoff for failed passes.
    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Config::default().into()
    }
}

impl From<Config> for ControllerConfig {
    fn from(config: Config) -> Self {
        Self {
            workers: config.workers,
            requeue_interval: config.requeue_interval,
            resync_interval: config.resync_interval,
            backoff: BackoffPolicy {
                base: config.backoff_base,
                max: config.backoff_max,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Runs the watcher, resync task, and workers for AppScalers.
pub struct Controller {
    store: Arc<dyn ClusterStore>,
    reconciler: Arc<AppScalerReconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller. Reconcile passes log under `span`.
    pub fn new(store: Arc<dyn ClusterStore>, config: ControllerConfig, span: Span) -> Self {
        let reconciler = Arc::new(AppScalerReconciler::new(
            store.clone(),
            config.requeue_interval,
            span,
        ));
        let queue = Arc::new(WorkQueue::new(config.backoff.clone()));

        Self {
            store,
            reconciler,
            queue,
            config,
        }
    }

    /// The controller's work queue.
    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Run until shutdown is signaled, then wait for every task to stop.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            requeue_interval_secs = self.config.requeue_interval.as_secs(),
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting AppScaler controller"
        );

        // Subscribe before the first resync lists objects, so no change
        // between the two is missed.
        let events = self.store.watch();
        let watcher = Watcher::new(self.store.clone(), self.queue.clone());

        let mut tasks = JoinSet::new();
        tasks.spawn({
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            async move { watcher.run(events, shutdown).await }
        });
        tasks.spawn({
            let shutdown = shutdown.clone();
            let interval = self.config.resync_interval;
            async move { watcher.run_resync(interval, shutdown).await }
        });
        for id in 0..self.config.workers {
            let worker = Worker::new(id, self.queue.clone(), self.reconciler.clone());
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.run(shutdown).await });
        }

        shutdown_signaled(&mut shutdown).await;
        info!("AppScaler controller shutting down");
        self.queue.shutdown();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }

        info!("AppScaler controller stopped");
    }
}

/// Resolve once shutdown is signaled or the sender is gone.
///
/// Holds no channel read guard once it returns.
pub(crate) async fn shutdown_signaled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
