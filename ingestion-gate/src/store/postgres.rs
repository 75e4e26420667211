use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};
use uuid::Uuid;

use crate::{
    error::StoreError,
    types::{
        BatchStatistics, BatchStatus, DuplicateEvent, Fields, ImportBatch, NewRawRecord,
        RawRecord, RecordOutcome, RecordStatus,
    },
};

use super::{BatchStore, InsertResult, RecordStore};

const UNIQUE_VIOLATION: &str = "23505";

/// Raw record store and batch store backed by the tables in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::unavailable("CONNECT", error))?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("SELECT", e))?;
        Ok(())
    }
}

// Connection-level failures are worth retrying, anything the database itself
// rejected is not
fn query_error(command: &str, error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let transient = code.starts_with("08")
                || code.starts_with("53")
                || code == "57P01"
                || code == "40001"
                || code == "40P01";
            if transient {
                StoreError::unavailable(command, error)
            } else {
                StoreError::Inconsistent(format!("{command} rejected: {error}"))
            }
        }
        sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::Inconsistent(format!("{command} returned unexpected rows: {error}"))
        }
        _ => StoreError::unavailable(command, error),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn decode_error(error: sqlx::Error) -> StoreError {
    StoreError::Inconsistent(format!("failed to decode row: {error}"))
}

fn record_from_row(row: &PgRow) -> Result<RawRecord, StoreError> {
    let source_kind: String = row.try_get("source_kind").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let payload: sqlx::types::Json<Fields> = row.try_get("payload").map_err(decode_error)?;

    Ok(RawRecord {
        record_id: row.try_get("record_id").map_err(decode_error)?,
        content_hash: row.try_get("content_hash").map_err(decode_error)?,
        batch_id: row.try_get("batch_id").map_err(decode_error)?,
        source_kind: source_kind.parse()?,
        source_origin: row.try_get("source_origin").map_err(decode_error)?,
        payload: payload.0,
        status: status.parse()?,
        admitted_at: row.try_get("admitted_at").map_err(decode_error)?,
        published_at: row.try_get("published_at").map_err(decode_error)?,
        publish_error: row.try_get("publish_error").map_err(decode_error)?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<ImportBatch, StoreError> {
    let source_kind: String = row.try_get("source_kind").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;

    Ok(ImportBatch {
        batch_id: row.try_get("batch_id").map_err(decode_error)?,
        source_kind: source_kind.parse()?,
        source_label: row.try_get("source_label").map_err(decode_error)?,
        status: status.parse()?,
        total_seen: row.try_get("total_seen").map_err(decode_error)?,
        admitted_count: row.try_get("admitted_count").map_err(decode_error)?,
        duplicate_count: row.try_get("duplicate_count").map_err(decode_error)?,
        failed_count: row.try_get("failed_count").map_err(decode_error)?,
        started_at: row.try_get("started_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
        error: row.try_get("error").map_err(decode_error)?,
    })
}

const RECORD_COLUMNS: &str = "record_id, content_hash, batch_id, source_kind, source_origin, payload, status, admitted_at, published_at, publish_error";

const BATCH_COLUMNS: &str = "batch_id, source_kind, source_label, status, total_seen, admitted_count, duplicate_count, failed_count, started_at, completed_at, error";

#[async_trait]
impl RecordStore for PgStore {
    async fn try_insert(&self, record: &NewRawRecord) -> Result<InsertResult, StoreError> {
        // The unique index on content_hash is the arbiter; concurrent inserts of
        // the same hash serialize on it and all but one do nothing
        let res = sqlx::query(
            r#"
INSERT INTO raw_records
    (record_id, content_hash, batch_id, source_kind, source_origin, payload, status, admitted_at)
VALUES
    ($1, $2, $3, $4, $5, $6, 'pending', NOW())
ON CONFLICT (content_hash) DO NOTHING
            "#,
        )
        .bind(record.record_id)
        .bind(&record.content_hash)
        .bind(record.batch_id)
        .bind(record.source_kind.as_str())
        .bind(&record.source_origin)
        .bind(sqlx::types::Json(&record.payload))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("INSERT", e))?;

        if res.rows_affected() == 1 {
            Ok(InsertResult::Inserted)
        } else {
            Ok(InsertResult::HashConflict)
        }
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError> {
        sqlx::query_scalar("SELECT record_id FROM raw_records WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("SELECT", e))
    }

    async fn append_duplicate_event(&self, event: &DuplicateEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO duplicate_events
    (event_id, content_hash, existing_record_id, batch_id, detected_at)
VALUES
    ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.content_hash)
        .bind(event.existing_record_id)
        .bind(event.batch_id)
        .bind(event.detected_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("INSERT", e))?;

        Ok(())
    }

    async fn get_record(&self, record_id: Uuid) -> Result<Option<RawRecord>, StoreError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM raw_records WHERE record_id = $1");
        let row = sqlx::query(&query)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("SELECT", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn finish_publish(
        &self,
        record_id: Uuid,
        status: RecordStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let published_at: Option<DateTime<Utc>> =
            (status == RecordStatus::Published).then(Utc::now);

        let res = sqlx::query(
            r#"
UPDATE raw_records
SET
    status = $2,
    published_at = $3,
    publish_error = $4
WHERE
    record_id = $1 AND status = 'pending'
            "#,
        )
        .bind(record_id)
        .bind(status.as_str())
        .bind(published_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("UPDATE", e))?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get_record(record_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::RecordNotFound(record_id)),
        }
    }

    async fn records_with_status(
        &self,
        status: RecordStatus,
        limit: i64,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM raw_records WHERE status = $1 ORDER BY admitted_at, record_id LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("SELECT", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn duplicate_events_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<DuplicateEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT event_id, content_hash, existing_record_id, batch_id, detected_at
FROM duplicate_events
WHERE batch_id = $1
ORDER BY detected_at, event_id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("SELECT", e))?;

        rows.iter()
            .map(|row| {
                Ok(DuplicateEvent {
                    event_id: row.try_get("event_id").map_err(decode_error)?,
                    content_hash: row.try_get("content_hash").map_err(decode_error)?,
                    existing_record_id: row.try_get("existing_record_id").map_err(decode_error)?,
                    batch_id: row.try_get("batch_id").map_err(decode_error)?,
                    detected_at: row.try_get("detected_at").map_err(decode_error)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn create_batch(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO import_batches
    (batch_id, source_kind, source_label, status, started_at)
VALUES
    ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.source_kind.as_str())
        .bind(&batch.source_label)
        .bind(batch.status.as_str())
        .bind(batch.started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateBatch(batch.batch_id)
            } else {
                query_error("INSERT", e)
            }
        })?;

        Ok(())
    }

    async fn increment(&self, batch_id: Uuid, outcome: RecordOutcome) -> Result<bool, StoreError> {
        let column = match outcome {
            RecordOutcome::Admitted => "admitted_count",
            RecordOutcome::Duplicate => "duplicate_count",
            RecordOutcome::Failed => "failed_count",
        };
        // One statement, so readers see either none or all of the increments
        let query = format!(
            r#"
UPDATE import_batches
SET
    total_seen = total_seen + 1,
    {column} = {column} + 1
WHERE
    batch_id = $1 AND status = 'running'
            "#
        );

        let res = sqlx::query(&query)
            .bind(batch_id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("UPDATE", e))?;

        Ok(res.rows_affected() == 1)
    }

    async fn finish_batch(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<Option<ImportBatch>, StoreError> {
        let query = format!(
            r#"
UPDATE import_batches
SET
    status = $2,
    completed_at = NOW(),
    error = $3
WHERE
    batch_id = $1 AND status = 'running'
RETURNING {BATCH_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(batch_id)
            .bind(status.as_str())
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("UPDATE", e))?;

        row.as_ref().map(batch_from_row).transpose()
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<ImportBatch>, StoreError> {
        let query = format!("SELECT {BATCH_COLUMNS} FROM import_batches WHERE batch_id = $1");
        let row = sqlx::query(&query)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("SELECT", e))?;

        row.as_ref().map(batch_from_row).transpose()
    }

    async fn statistics(&self) -> Result<BatchStatistics, StoreError> {
        let row = sqlx::query(
            r#"
SELECT
    COUNT(*) AS total_batches,
    COUNT(*) FILTER (WHERE status = 'running') AS running,
    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
    COALESCE(SUM(total_seen), 0)::BIGINT AS total_seen,
    COALESCE(SUM(admitted_count), 0)::BIGINT AS admitted_count,
    COALESCE(SUM(duplicate_count), 0)::BIGINT AS duplicate_count,
    COALESCE(SUM(failed_count), 0)::BIGINT AS failed_count
FROM import_batches
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("SELECT", e))?;

        Ok(BatchStatistics {
            total_batches: row.try_get("total_batches").map_err(decode_error)?,
            running: row.try_get("running").map_err(decode_error)?,
            completed: row.try_get("completed").map_err(decode_error)?,
            failed: row.try_get("failed").map_err(decode_error)?,
            total_seen: row.try_get("total_seen").map_err(decode_error)?,
            admitted_count: row.try_get("admitted_count").map_err(decode_error)?,
            duplicate_count: row.try_get("duplicate_count").map_err(decode_error)?,
            failed_count: row.try_get("failed_count").map_err(decode_error)?,
        })
    }
}
