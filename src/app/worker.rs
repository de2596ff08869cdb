//! Background worker that re-announces items the bus never acknowledged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ReconcileConfig;

use super::ingestion::IngestionCoordinator;

/// Configuration for the background worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between processing batches
    pub poll_interval: Duration,
    /// Number of ledger entries to process per batch
    pub batch_size: i64,
    /// Whether the worker is enabled
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            enabled: true,
        }
    }
}

impl From<&ReconcileConfig> for WorkerConfig {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            poll_interval: config.interval,
            batch_size: config.batch_size,
            enabled: config.enabled,
        }
    }
}

pub struct AnnouncementRetryWorker {
    ingestion: Arc<IngestionCoordinator>,
    config: WorkerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl AnnouncementRetryWorker {
    pub fn new(
        ingestion: Arc<IngestionCoordinator>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ingestion,
            config,
            shutdown_rx,
        }
    }

    /// Run the worker loop
    pub async fn run(mut self) {
        if !self.config.enabled {
            info!("Announcement retry worker is disabled");
            return;
        }

        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Starting announcement retry worker"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.process_batch().await;
                }
                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        info!("Announcement retry worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn process_batch(&self) {
        match self.ingestion.announce_pending(self.config.batch_size).await {
            Ok(0) => {}
            Ok(count) => {
                info!(count, "Re-announced pending items");
            }
            Err(e) => {
                error!(error = %e, "Error processing pending announcements");
            }
        }
    }
}

/// Spawn the background worker as a tokio task
pub fn spawn_worker(
    ingestion: Arc<IngestionCoordinator>,
    config: WorkerConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = AnnouncementRetryWorker::new(ingestion, config, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}
