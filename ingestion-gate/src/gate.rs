//! The deduplication gate: the only writer of raw records and duplicate events.
//!
//! Admission is a single unconditional insert against the unique content hash.
//! There is no read before it, so any number of concurrent callers racing on
//! the same logical record end up with one `Admitted` and the rest `Duplicate`.
use std::{sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    error::{AdmitError, StoreError},
    hasher,
    metrics_const::{
        ADMISSION_DURATION_HISTOGRAM, ADMISSION_INCONSISTENT_COUNTER, ADMISSION_OUTCOME_COUNTER,
    },
    store::{InsertResult, RecordStore},
    types::{DuplicateEvent, Fields, NewRawRecord, Outcome, RecordOutcome, SourceKind},
};

#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn RecordStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Hashes `fields` and admits them, or records a duplicate event against the
    /// row that already holds the hash. Exactly one of the two rows is written
    /// when this returns Ok.
    pub async fn admit(
        &self,
        source_kind: SourceKind,
        batch_id: Uuid,
        origin: &str,
        fields: &Fields,
    ) -> Result<Outcome, AdmitError> {
        self.admit_as(Uuid::now_v7(), source_kind, batch_id, origin, fields)
            .await
    }

    /// Like [`DedupGate::admit`] with a caller-chosen id. Retrying with the same
    /// id after a transient error is safe: if the earlier attempt committed, the
    /// row found under the hash is our own and the outcome is `Admitted`.
    pub async fn admit_as(
        &self,
        record_id: Uuid,
        source_kind: SourceKind,
        batch_id: Uuid,
        origin: &str,
        fields: &Fields,
    ) -> Result<Outcome, AdmitError> {
        let start = Instant::now();
        let content_hash = hasher::content_hash(source_kind, fields)?.into_string();

        let record = NewRawRecord {
            record_id,
            content_hash,
            batch_id,
            source_kind,
            source_origin: origin.to_owned(),
            payload: fields.clone(),
        };

        let outcome = match self.store.try_insert(&record).await? {
            InsertResult::Inserted => Outcome::Admitted(record.record_id),
            InsertResult::HashConflict => {
                let existing = self.existing_record(&record.content_hash).await?;
                if existing == record.record_id {
                    debug!(record_id = %existing, origin, "earlier attempt already admitted record");
                    return Ok(self.finish(source_kind, start, Outcome::Admitted(existing)));
                }
                let event = DuplicateEvent {
                    event_id: Uuid::now_v7(),
                    content_hash: record.content_hash,
                    existing_record_id: existing,
                    batch_id,
                    detected_at: Utc::now(),
                };
                self.store.append_duplicate_event(&event).await?;
                debug!(
                    batch_id = %batch_id,
                    existing_record_id = %existing,
                    origin,
                    "duplicate record rejected"
                );
                Outcome::Duplicate(existing)
            }
        };

        Ok(self.finish(source_kind, start, outcome))
    }

    fn finish(&self, source_kind: SourceKind, start: Instant, outcome: Outcome) -> Outcome {
        metrics::counter!(
            ADMISSION_OUTCOME_COUNTER,
            "source_kind" => source_kind.as_str(),
            "outcome" => RecordOutcome::from(outcome).as_str()
        )
        .increment(1);
        metrics::histogram!(ADMISSION_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());
        outcome
    }

    // Rows are never deleted, so a conflict with no visible row means the store
    // is broken rather than racing
    async fn existing_record(&self, content_hash: &str) -> Result<Uuid, StoreError> {
        match self.store.find_by_hash(content_hash).await? {
            Some(id) => Ok(id),
            None => {
                metrics::counter!(ADMISSION_INCONSISTENT_COUNTER).increment(1);
                error!(content_hash, "hash conflict reported but no row holds the hash");
                Err(StoreError::Inconsistent(format!(
                    "no record holds conflicting hash {content_hash}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::{error::NormalizeError, store::MemoryStore, types::RecordStatus};

    fn parcel(state_id: &str, owner: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("STATEID".into(), json!(state_id));
        fields.insert("OWNERNME1".into(), json!(owner));
        fields.insert("SITEADRESS".into(), json!("123 MAIN ST"));
        fields.insert("CNTASSDVALUE".into(), json!("150000.00"));
        fields
    }

    #[tokio::test]
    async fn test_admit_then_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        let batch_id = Uuid::now_v7();
        let fields = parcel("WI-1", "Smith John");

        let first = gate
            .admit(SourceKind::Parcel, batch_id, "a.csv#1", &fields)
            .await
            .unwrap();
        let second = gate
            .admit(SourceKind::Parcel, batch_id, "a.csv#2", &fields)
            .await
            .unwrap();

        let Outcome::Admitted(record_id) = first else {
            panic!("expected admission, got {first:?}");
        };
        assert_eq!(second, Outcome::Duplicate(record_id));

        let stored = store.get_record(record_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, fields);
        assert_eq!(stored.status, RecordStatus::Pending);
        assert_eq!(stored.source_origin, "a.csv#1");

        let events = store.duplicate_events_for_batch(batch_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].existing_record_id, record_id);
        assert_eq!(events[0].content_hash, stored.content_hash);
    }

    #[tokio::test]
    async fn test_case_and_whitespace_variants_are_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        let batch_id = Uuid::now_v7();

        gate.admit(SourceKind::Parcel, batch_id, "a", &parcel("WI-1", "SMITH JOHN"))
            .await
            .unwrap();
        let outcome = gate
            .admit(
                SourceKind::Parcel,
                batch_id,
                "b",
                &parcel("  wi-1 ", "smith john  "),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Duplicate(_)));
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_same_fields_under_different_kinds_are_distinct() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        let mut fields = Fields::new();
        fields.insert("STATEID".into(), json!("X"));
        fields.insert("ENTITY_ID".into(), json!("X"));
        fields.insert("DOC_NUMBER".into(), json!("X"));

        for kind in SourceKind::ALL {
            let outcome = gate.admit(kind, Uuid::now_v7(), "o", &fields).await.unwrap();
            assert!(matches!(outcome, Outcome::Admitted(_)), "{kind}");
        }
        assert_eq!(store.record_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_record_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        let mut fields = Fields::new();
        fields.insert("STATEID".into(), json!({"nested": true}));

        let err = gate
            .admit(SourceKind::Parcel, Uuid::now_v7(), "o", &fields)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AdmitError::Malformed(NormalizeError::MalformedRecord { .. })
        ));
        assert!(!err.is_transient());
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.duplicate_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_transient_and_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        store.fail_next_inserts(1);

        let err = gate
            .admit(SourceKind::Parcel, Uuid::now_v7(), "o", &parcel("WI-1", "A"))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_lost_reply_is_still_admitted() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        let batch_id = Uuid::now_v7();
        let record_id = Uuid::now_v7();
        let fields = parcel("WI-1", "A");
        store.lose_next_insert_replies(1);

        let err = gate
            .admit_as(record_id, SourceKind::Parcel, batch_id, "o", &fields)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.record_count(), 1);

        let retried = gate
            .admit_as(record_id, SourceKind::Parcel, batch_id, "o", &fields)
            .await
            .unwrap();
        assert_eq!(retried, Outcome::Admitted(record_id));
        assert_eq!(store.duplicate_count(), 0);

        // A different id for the same content is a real duplicate
        let other = gate
            .admit(SourceKind::Parcel, batch_id, "p", &fields)
            .await
            .unwrap();
        assert_eq!(other, Outcome::Duplicate(record_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_converge_to_one() {
        let store = Arc::new(MemoryStore::new());
        let gate = DedupGate::new(store.clone());
        let fields = parcel("WI-RACE", "Racer");

        let mut handles = Vec::new();
        for i in 0..64 {
            let gate = gate.clone();
            let fields = fields.clone();
            handles.push(tokio::spawn(async move {
                gate.admit(SourceKind::Parcel, Uuid::now_v7(), &format!("r{i}"), &fields)
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        let mut ids = HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            if matches!(outcome, Outcome::Admitted(_)) {
                admitted += 1;
            }
            ids.insert(outcome.record_id());
        }

        assert_eq!(admitted, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.duplicate_count(), 63);
    }
}
