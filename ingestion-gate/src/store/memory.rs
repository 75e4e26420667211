use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::StoreError,
    types::{
        BatchStatistics, BatchStatus, DuplicateEvent, ImportBatch, NewRawRecord, RawRecord,
        RecordOutcome, RecordStatus,
    },
};

use super::{BatchStore, InsertResult, RecordStore};

#[derive(Default)]
struct State {
    records: HashMap<Uuid, RawRecord>,
    by_hash: HashMap<String, Uuid>,
    duplicates: Vec<DuplicateEvent>,
    batches: HashMap<Uuid, ImportBatch>,
}

/// In-process store with the same atomicity as the Postgres one: every
/// operation runs under a single lock that is never held across an await.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_inserts: AtomicU32,
    lost_insert_replies: AtomicU32,
    failing_increments: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` insert attempts fail as if storage were unreachable.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` inserts commit but report a storage error, like
    /// a connection dropped after the commit.
    pub fn lose_next_insert_replies(&self, count: u32) {
        self.lost_insert_replies.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` counter updates fail as if storage were unreachable.
    pub fn fail_next_increments(&self, count: u32) {
        self.failing_increments.store(count, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn duplicate_count(&self) -> usize {
        self.lock().duplicates.len()
    }

    // Every mutation under the lock is a single insert or assignment
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn try_insert(&self, record: &NewRawRecord) -> Result<InsertResult, StoreError> {
        if Self::take_injected(&self.failing_inserts) {
            return Err(StoreError::unavailable("INSERT", "injected failure"));
        }

        let mut state = self.lock();
        if state.by_hash.contains_key(&record.content_hash) {
            return Ok(InsertResult::HashConflict);
        }
        if state.records.contains_key(&record.record_id) {
            return Err(StoreError::Inconsistent(format!(
                "record id {} reused",
                record.record_id
            )));
        }

        state
            .by_hash
            .insert(record.content_hash.clone(), record.record_id);
        state
            .records
            .insert(record.record_id, record.clone().into_pending(Utc::now()));

        if Self::take_injected(&self.lost_insert_replies) {
            return Err(StoreError::unavailable("INSERT", "injected lost reply"));
        }
        Ok(InsertResult::Inserted)
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.lock().by_hash.get(content_hash).copied())
    }

    async fn append_duplicate_event(&self, event: &DuplicateEvent) -> Result<(), StoreError> {
        self.lock().duplicates.push(event.clone());
        Ok(())
    }

    async fn get_record(&self, record_id: Uuid) -> Result<Option<RawRecord>, StoreError> {
        Ok(self.lock().records.get(&record_id).cloned())
    }

    async fn finish_publish(
        &self,
        record_id: Uuid,
        status: RecordStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(record) = state.records.get_mut(&record_id) else {
            return Err(StoreError::RecordNotFound(record_id));
        };
        if record.status != RecordStatus::Pending {
            return Ok(false);
        }

        record.status = status;
        record.publish_error = error.map(str::to_owned);
        if status == RecordStatus::Published {
            record.published_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn records_with_status(
        &self,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let state = self.lock();
        let mut matching: Vec<RawRecord> = state
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.admitted_at, r.record_id));
        matching.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(matching)
    }

    async fn duplicate_events_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<DuplicateEvent>, StoreError> {
        Ok(self
            .lock()
            .duplicates
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::DuplicateBatch(batch.batch_id));
        }
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn increment(&self, batch_id: Uuid, outcome: RecordOutcome) -> Result<bool, StoreError> {
        if Self::take_injected(&self.failing_increments) {
            return Err(StoreError::unavailable("UPDATE", "injected failure"));
        }

        let mut state = self.lock();
        match state.batches.get_mut(&batch_id) {
            Some(batch) if batch.status == BatchStatus::Running => {
                batch.apply(outcome);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_batch(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<Option<ImportBatch>, StoreError> {
        let mut state = self.lock();
        match state.batches.get_mut(&batch_id) {
            Some(batch) if batch.status == BatchStatus::Running => {
                batch.status = status;
                batch.completed_at = Some(Utc::now());
                batch.error = error.map(str::to_owned);
                Ok(Some(batch.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<ImportBatch>, StoreError> {
        Ok(self.lock().batches.get(&batch_id).cloned())
    }

    async fn statistics(&self) -> Result<BatchStatistics, StoreError> {
        let state = self.lock();
        let mut stats = BatchStatistics::default();
        for batch in state.batches.values() {
            stats.total_batches += 1;
            match batch.status {
                BatchStatus::Running => stats.running += 1,
                BatchStatus::Completed => stats.completed += 1,
                BatchStatus::Failed => stats.failed += 1,
            }
            stats.total_seen += batch.total_seen;
            stats.admitted_count += batch.admitted_count;
            stats.duplicate_count += batch.duplicate_count;
            stats.failed_count += batch.failed_count;
        }
        Ok(stats)
    }
}
