//! Storage contracts for the raw record store and the batch tracker.
//!
//! Both traits expose atomic primitives only. Deciding what a conflicting insert
//! or a rejected transition means is the job of the gate and the tracker.
use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::StoreError,
    types::{
        BatchStatistics, BatchStatus, DuplicateEvent, ImportBatch, NewRawRecord, RawRecord,
        RecordOutcome, RecordStatus,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of the unconditional insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// The uniqueness constraint on the content hash rejected the row.
    HashConflict,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts the row in a single atomic statement. A row with the same content
    /// hash already present makes this return `HashConflict` and write nothing.
    async fn try_insert(&self, record: &NewRawRecord) -> Result<InsertResult, StoreError>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError>;

    async fn append_duplicate_event(&self, event: &DuplicateEvent) -> Result<(), StoreError>;

    async fn get_record(&self, record_id: Uuid) -> Result<Option<RawRecord>, StoreError>;

    /// Moves a pending record to `status`. Returns false if the record was not
    /// pending, since both publish states are terminal.
    async fn finish_publish(
        &self,
        record_id: Uuid,
        status: RecordStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Oldest first.
    async fn records_with_status(
        &self,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<RawRecord>, StoreError>;

    async fn duplicate_events_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<DuplicateEvent>, StoreError>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Fails with `DuplicateBatch` if the id is already known.
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError>;

    /// Bumps `total_seen` and the counter for `outcome` together, only while the
    /// batch is running. Returns false if nothing was updated.
    async fn increment(&self, batch_id: Uuid, outcome: RecordOutcome) -> Result<bool, StoreError>;

    /// Moves a running batch to a terminal status, setting `completed_at`.
    /// Returns `None` if the batch was not running (or does not exist).
    async fn finish_batch(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<Option<ImportBatch>, StoreError>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<ImportBatch>, StoreError>;

    async fn statistics(&self) -> Result<BatchStatistics, StoreError>;
}
