//! Lifecycle and counters of import batches.
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::StoreError,
    metrics_const::BATCH_FINISHED_COUNTER,
    store::BatchStore,
    types::{BatchStatistics, BatchStatus, ImportBatch, RecordOutcome, SourceKind},
};

#[derive(Clone)]
pub struct BatchTracker {
    store: Arc<dyn BatchStore>,
}

impl BatchTracker {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self { store }
    }

    pub async fn start(
        &self,
        batch_id: Uuid,
        source_kind: SourceKind,
        source_label: &str,
    ) -> Result<ImportBatch, StoreError> {
        let batch = ImportBatch::new(batch_id, source_kind, source_label);
        self.store.create_batch(&batch).await?;
        info!(batch_id = %batch_id, source_kind = %source_kind, source_label, "batch started");
        Ok(batch)
    }

    /// Counts one resolved record. `total_seen` and the outcome's counter move
    /// together in one store update.
    pub async fn record_outcome(
        &self,
        batch_id: Uuid,
        outcome: RecordOutcome,
    ) -> Result<(), StoreError> {
        if self.store.increment(batch_id, outcome).await? {
            return Ok(());
        }

        match self.store.get_batch(batch_id).await? {
            None => Err(StoreError::BatchNotFound(batch_id)),
            Some(batch) => Err(StoreError::InvalidTransition {
                batch_id,
                current: batch.status,
                requested: BatchStatus::Running,
            }),
        }
    }

    pub async fn complete(&self, batch_id: Uuid) -> Result<ImportBatch, StoreError> {
        self.finish(batch_id, BatchStatus::Completed, None).await
    }

    /// Fails the batch with a human readable reason. Failing an already failed
    /// batch keeps the first reason.
    pub async fn fail(&self, batch_id: Uuid, reason: &str) -> Result<ImportBatch, StoreError> {
        self.finish(batch_id, BatchStatus::Failed, Some(reason)).await
    }

    /// Never waits on a running driver; reads whatever counters are committed.
    pub async fn get_status(&self, batch_id: Uuid) -> Result<ImportBatch, StoreError> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    pub async fn statistics(&self) -> Result<BatchStatistics, StoreError> {
        self.store.statistics().await
    }

    async fn finish(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        reason: Option<&str>,
    ) -> Result<ImportBatch, StoreError> {
        if let Some(batch) = self.store.finish_batch(batch_id, status, reason).await? {
            metrics::counter!(BATCH_FINISHED_COUNTER, "status" => status.as_str()).increment(1);
            match status {
                BatchStatus::Failed => warn!(
                    batch_id = %batch_id,
                    total_seen = batch.total_seen,
                    reason = reason.unwrap_or_default(),
                    "batch failed"
                ),
                _ => info!(
                    batch_id = %batch_id,
                    total_seen = batch.total_seen,
                    admitted = batch.admitted_count,
                    duplicates = batch.duplicate_count,
                    failed = batch.failed_count,
                    "batch {}", status
                ),
            }
            return Ok(batch);
        }

        // The conditional update touched nothing: either the batch is unknown or
        // it already left running
        let current = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        if current.status == status {
            Ok(current)
        } else {
            Err(StoreError::InvalidTransition {
                batch_id,
                current: current.status,
                requested: status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> BatchTracker {
        BatchTracker::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_start_creates_running_batch_with_zero_counters() {
        let tracker = tracker();
        let id = Uuid::now_v7();

        let batch = tracker.start(id, SourceKind::Parcel, "dane.csv").await.unwrap();

        assert_eq!(batch.status, BatchStatus::Running);
        assert_eq!(batch.total_seen, 0);
        assert!(batch.completed_at.is_none());
        assert_eq!(tracker.get_status(id).await.unwrap(), batch);
    }

    #[tokio::test]
    async fn test_start_twice_is_duplicate_batch() {
        let tracker = tracker();
        let id = Uuid::now_v7();
        tracker.start(id, SourceKind::Parcel, "a").await.unwrap();

        let err = tracker.start(id, SourceKind::Parcel, "a").await.unwrap_err();

        assert_eq!(err, StoreError::DuplicateBatch(id));
    }

    #[tokio::test]
    async fn test_outcomes_keep_sum_invariant() {
        let tracker = tracker();
        let id = Uuid::now_v7();
        tracker.start(id, SourceKind::TransferReturn, "retr.csv").await.unwrap();

        for outcome in [
            RecordOutcome::Admitted,
            RecordOutcome::Admitted,
            RecordOutcome::Duplicate,
            RecordOutcome::Failed,
        ] {
            tracker.record_outcome(id, outcome).await.unwrap();
            assert!(tracker.get_status(id).await.unwrap().counters_balanced());
        }

        let batch = tracker.get_status(id).await.unwrap();
        assert_eq!(
            (batch.total_seen, batch.admitted_count, batch.duplicate_count, batch.failed_count),
            (4, 2, 1, 1)
        );
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let tracker = tracker();
        let id = Uuid::now_v7();
        tracker.start(id, SourceKind::Parcel, "a").await.unwrap();

        let first = tracker.complete(id).await.unwrap();
        let second = tracker.complete(id).await.unwrap();

        assert_eq!(first.status, BatchStatus::Completed);
        assert!(first.completed_at.is_some());
        assert_eq!(first.completed_at, second.completed_at);
    }

    #[tokio::test]
    async fn test_fail_is_idempotent_and_keeps_first_reason() {
        let tracker = tracker();
        let id = Uuid::now_v7();
        tracker.start(id, SourceKind::Parcel, "a").await.unwrap();

        tracker.fail(id, "truncated file").await.unwrap();
        let again = tracker.fail(id, "another reason").await.unwrap();

        assert_eq!(again.status, BatchStatus::Failed);
        assert_eq!(again.error.as_deref(), Some("truncated file"));
    }

    #[tokio::test]
    async fn test_terminal_status_cannot_be_overwritten() {
        let tracker = tracker();
        let failed = Uuid::now_v7();
        let completed = Uuid::now_v7();
        tracker.start(failed, SourceKind::Parcel, "a").await.unwrap();
        tracker.start(completed, SourceKind::Parcel, "b").await.unwrap();
        tracker.fail(failed, "boom").await.unwrap();
        tracker.complete(completed).await.unwrap();

        assert_eq!(
            tracker.complete(failed).await.unwrap_err(),
            StoreError::InvalidTransition {
                batch_id: failed,
                current: BatchStatus::Failed,
                requested: BatchStatus::Completed,
            }
        );
        assert!(matches!(
            tracker.fail(completed, "late").await.unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));
        assert!(matches!(
            tracker
                .record_outcome(completed, RecordOutcome::Admitted)
                .await
                .unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));

        let batch = tracker.get_status(completed).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.total_seen, 0);
        assert!(batch.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_batch() {
        let tracker = tracker();
        let id = Uuid::now_v7();

        assert_eq!(
            tracker.get_status(id).await.unwrap_err(),
            StoreError::BatchNotFound(id)
        );
        assert_eq!(
            tracker
                .record_outcome(id, RecordOutcome::Failed)
                .await
                .unwrap_err(),
            StoreError::BatchNotFound(id)
        );
        assert_eq!(
            tracker.complete(id).await.unwrap_err(),
            StoreError::BatchNotFound(id)
        );
    }

    #[tokio::test]
    async fn test_statistics_aggregate_across_batches() {
        let tracker = tracker();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        tracker.start(a, SourceKind::Parcel, "a").await.unwrap();
        tracker.start(b, SourceKind::CorporateEntity, "b").await.unwrap();
        tracker.record_outcome(a, RecordOutcome::Admitted).await.unwrap();
        tracker.record_outcome(b, RecordOutcome::Duplicate).await.unwrap();
        tracker.complete(a).await.unwrap();

        let stats = tracker.statistics().await.unwrap();

        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total_seen, 2);
        assert_eq!(stats.admitted_count, 1);
        assert_eq!(stats.duplicate_count, 1);
    }
}
