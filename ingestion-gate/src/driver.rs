//! Streaming ingest driver: one forward pass over one source, one record at a
//! time, through the gate and into the batch counters.
use std::{future::Future, time::Duration, time::Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    backoff::{BackoffPolicy, RetryPolicy},
    batch::BatchTracker,
    error::{AdmitError, IngestError, StoreError},
    gate::DedupGate,
    metrics_const::{
        ADMISSION_OUTCOME_COUNTER, BATCHES_RUNNING_GAUGE, BATCH_DURATION_HISTOGRAM,
        STORAGE_RETRY_COUNTER,
    },
    publish::{PublishRequest, PublishSender},
    source::RecordStream,
    types::{Fields, ImportBatch, Outcome, RecordOutcome, SourceKind},
};

pub const ABORTED_REASON: &str = "aborted by operator";
pub const SHUTDOWN_REASON: &str = "service shutting down";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverPolicy {
    /// Records processed between cooperative yields.
    pub chunk_size: usize,
    /// Applied to transient storage errors only; duplicates are never retried.
    pub storage_retry: RetryPolicy,
    /// Consecutive failed records after which the batch is failed. Zero disables
    /// escalation.
    pub max_consecutive_failures: u32,
}

impl Default for DriverPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            storage_retry: RetryPolicy::new(
                3,
                BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(2)),
            ),
            max_consecutive_failures: 100,
        }
    }
}

#[derive(Clone)]
pub struct IngestDriver {
    gate: DedupGate,
    tracker: BatchTracker,
    publisher: Option<PublishSender>,
    policy: DriverPolicy,
    // Shared by every clone, stops all batches at once
    shutdown: CancellationToken,
}

impl IngestDriver {
    pub fn new(
        gate: DedupGate,
        tracker: BatchTracker,
        publisher: Option<PublishSender>,
        policy: DriverPolicy,
    ) -> Self {
        Self {
            gate,
            tracker,
            publisher,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops every batch this driver (or any clone of it) is running. Each one
    /// is failed with [`SHUTDOWN_REASON`] before its next record is pulled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drives `source` to the end for a batch already started with the tracker,
    /// and returns the batch in its terminal state.
    ///
    /// The batch completes when the source is exhausted. A fatal source error,
    /// too many consecutive record failures, `cancel` or a driver shutdown fail
    /// it, and no record is admitted after that. Errors are returned only when
    /// the tracker itself cannot be updated, after a last attempt to fail the
    /// batch.
    pub async fn run(
        &self,
        batch: &ImportBatch,
        mut source: RecordStream,
        cancel: CancellationToken,
    ) -> Result<ImportBatch, IngestError> {
        let start = Instant::now();
        metrics::gauge!(BATCHES_RUNNING_GAUGE).increment(1.0);
        let result = self.drive(batch, &mut source, &cancel).await;
        metrics::gauge!(BATCHES_RUNNING_GAUGE).decrement(1.0);
        metrics::histogram!(BATCH_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            error!(batch_id = %batch.batch_id, "driver stopped without finishing batch: {}", e);
        }
        result
    }

    async fn drive(
        &self,
        batch: &ImportBatch,
        source: &mut RecordStream,
        cancel: &CancellationToken,
    ) -> Result<ImportBatch, IngestError> {
        let batch_id = batch.batch_id;
        let kind = batch.source_kind;
        let mut since_yield = 0usize;
        let mut consecutive_failures = 0u32;

        loop {
            // Only waiting on the source is cancellable, an admission in flight
            // always runs to completion
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return self.fail(batch_id, SHUTDOWN_REASON).await;
                }
                _ = cancel.cancelled() => {
                    return self.fail(batch_id, ABORTED_REASON).await;
                }
                next = source.next() => next,
            };

            let record = match next {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    return self.fail(batch_id, &e.to_string()).await;
                }
            };

            let origin = format!("{}#{}", batch.source_label, record.index);
            let admitted = self.admit(kind, batch_id, &origin, &record.fields).await;
            let counted = match &admitted {
                Ok(outcome) => RecordOutcome::from(*outcome),
                Err(_) => RecordOutcome::Failed,
            };

            if let Err(e) = self
                .with_storage_retry("record_outcome", || {
                    self.tracker.record_outcome(batch_id, counted)
                })
                .await
            {
                return Err(self.abandon(batch_id, e).await);
            }

            match admitted {
                Ok(Outcome::Admitted(record_id)) => {
                    consecutive_failures = 0;
                    self.hand_off(PublishRequest {
                        record_id,
                        source_kind: kind,
                        batch_id,
                    })
                    .await;
                }
                Ok(Outcome::Duplicate(_)) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    metrics::counter!(
                        ADMISSION_OUTCOME_COUNTER,
                        "source_kind" => kind.as_str(),
                        "outcome" => RecordOutcome::Failed.as_str()
                    )
                    .increment(1);
                    warn!(batch_id = %batch_id, origin = %origin, "record failed: {}", e);

                    let limit = self.policy.max_consecutive_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        let reason = format!(
                            "{consecutive_failures} consecutive records failed, last error: {e}"
                        );
                        return self.fail(batch_id, &reason).await;
                    }
                }
            }

            since_yield += 1;
            if since_yield >= self.policy.chunk_size.max(1) {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }

        match self
            .with_storage_retry("complete", || self.tracker.complete(batch_id))
            .await
        {
            Ok(batch) => Ok(batch),
            Err(e) => Err(self.abandon(batch_id, e).await),
        }
    }

    // Best effort, storage may refuse this write too
    async fn abandon(&self, batch_id: Uuid, cause: StoreError) -> IngestError {
        let reason = format!("batch state could not be updated: {cause}");
        if let Err(e) = self.tracker.fail(batch_id, &reason).await {
            error!(batch_id = %batch_id, "could not fail abandoned batch: {}", e);
        }
        IngestError::from(cause)
    }

    async fn admit(
        &self,
        kind: SourceKind,
        batch_id: Uuid,
        origin: &str,
        fields: &Fields,
    ) -> Result<Outcome, AdmitError> {
        let retry = self.policy.storage_retry;
        let attempts = retry.attempts();
        let mut attempt = 0;
        // Same id on every attempt, so a commit whose reply was lost is
        // recognised as our own admission
        let record_id = Uuid::now_v7();

        loop {
            match self
                .gate
                .admit_as(record_id, kind, batch_id, origin, fields)
                .await
            {
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    metrics::counter!(STORAGE_RETRY_COUNTER, "op" => "admit").increment(1);
                    warn!(batch_id = %batch_id, origin, attempt = attempt + 1, "retrying admission: {}", e);
                    tokio::time::sleep(retry.backoff.next_delay(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn with_storage_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let retry = self.policy.storage_retry;
        let attempts = retry.attempts();
        let mut attempt = 0;

        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    metrics::counter!(STORAGE_RETRY_COUNTER, "op" => op).increment(1);
                    warn!(op, attempt = attempt + 1, "retrying batch update: {}", e);
                    tokio::time::sleep(retry.backoff.next_delay(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn fail(&self, batch_id: Uuid, reason: &str) -> Result<ImportBatch, IngestError> {
        info!(batch_id = %batch_id, reason, "stopping batch");
        Ok(self
            .with_storage_retry("fail", || self.tracker.fail(batch_id, reason))
            .await?)
    }

    // A closed channel leaves the record pending, it is picked up again by the
    // startup requeue
    async fn hand_off(&self, request: PublishRequest) {
        let Some(sender) = &self.publisher else {
            return;
        };
        if sender.send(request).await.is_err() {
            error!(
                record_id = %request.record_id,
                "publish channel closed, record left pending"
            );
        }
    }
}
