use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    batch::BatchTracker,
    driver::{DriverPolicy, IngestDriver},
    error::StoreError,
    gate::DedupGate,
    publish::PublishSender,
    source::RecordStream,
    store::{BatchStore, RecordStore},
    types::{ImportBatch, SourceKind},
};

/// Everything request handlers need, shared behind an `Arc`.
pub struct AppContext {
    pub tracker: BatchTracker,
    pub driver: IngestDriver,
    // Cancellation handles of the batches driven by this process
    running: DashMap<Uuid, CancellationToken>,
    drivers: TaskTracker,
}

/// Result of an operator abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResult {
    /// The driver was signalled and will fail the batch.
    Signalled,
    /// Known, but not running in this process.
    NotRunning,
}

impl AppContext {
    pub fn new(
        records: Arc<dyn RecordStore>,
        batches: Arc<dyn BatchStore>,
        publisher: Option<PublishSender>,
        policy: DriverPolicy,
    ) -> Self {
        let tracker = BatchTracker::new(batches);
        let driver = IngestDriver::new(DedupGate::new(records), tracker.clone(), publisher, policy);

        Self {
            tracker,
            driver,
            running: DashMap::new(),
            drivers: TaskTracker::new(),
        }
    }

    /// Starts a batch and drives `source` on a background task. Returns as soon
    /// as the batch exists, so its status can be queried right away.
    pub async fn start_batch(
        self: &Arc<Self>,
        source_kind: SourceKind,
        source_label: &str,
        source: RecordStream,
    ) -> Result<ImportBatch, StoreError> {
        let batch = self
            .tracker
            .start(Uuid::now_v7(), source_kind, source_label)
            .await?;

        let cancel = CancellationToken::new();
        self.running.insert(batch.batch_id, cancel.clone());

        let context = self.clone();
        let spawned = batch.clone();
        self.drivers.spawn(async move {
            match context.driver.run(&spawned, source, cancel).await {
                Ok(done) => info!(batch_id = %done.batch_id, status = %done.status, "batch finished"),
                Err(e) => error!(batch_id = %spawned.batch_id, "batch driver failed: {}", e),
            }
            context.running.remove(&spawned.batch_id);
        });

        Ok(batch)
    }

    pub async fn abort(&self, batch_id: Uuid) -> Result<AbortResult, StoreError> {
        if let Some(token) = self.running.get(&batch_id) {
            token.cancel();
            info!(batch_id = %batch_id, "abort requested");
            return Ok(AbortResult::Signalled);
        }

        // Unknown batches are a not-found, not a conflict
        self.tracker.get_status(batch_id).await?;
        Ok(AbortResult::NotRunning)
    }

    pub fn running_batches(&self) -> usize {
        self.running.len()
    }

    /// Stops every running batch and waits up to `timeout` for their drivers
    /// to fail them. Returns false if some driver did not finish in time, in
    /// which case its batch may still read `running`.
    pub async fn cancel_all(&self, timeout: Duration) -> bool {
        let running = self.running_batches();
        if running > 0 {
            info!(running, "stopping running batches");
        }
        self.driver.shutdown();
        self.drivers.close();

        if tokio::time::timeout(timeout, self.drivers.wait()).await.is_err() {
            warn!(
                running = self.running_batches(),
                "batch drivers did not stop in time"
            );
            return false;
        }
        true
    }
}
