use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;

/// A field-mapping as produced by a parser: column or attribute name to scalar value.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// The closed set of source kinds we ingest. Each kind carries its own identity
/// rule (see `hasher`) and its own downstream destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Parcel,
    TransferReturn,
    CorporateEntity,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Parcel,
        SourceKind::TransferReturn,
        SourceKind::CorporateEntity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Parcel => "parcel",
            SourceKind::TransferReturn => "transfer_return",
            SourceKind::CorporateEntity => "corporate_entity",
        }
    }

    /// Queue destination admitted records of this kind are handed to.
    pub fn destination(&self) -> &'static str {
        match self {
            SourceKind::Parcel => "ingest_parcel_records",
            SourceKind::TransferReturn => "ingest_transfer_return_records",
            SourceKind::CorporateEntity => "ingest_corporate_entity_records",
        }
    }

    pub fn dead_letter_destination(&self) -> &'static str {
        match self {
            SourceKind::Parcel => "ingest_parcel_records_dead_letter",
            SourceKind::TransferReturn => "ingest_transfer_return_records_dead_letter",
            SourceKind::CorporateEntity => "ingest_corporate_entity_records_dead_letter",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Accepts our own names as well as the upstream file codes (PARCEL, RETR, DFI).
impl FromStr for SourceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parcel" => Ok(SourceKind::Parcel),
            "transfer_return" | "retr" => Ok(SourceKind::TransferReturn),
            "corporate_entity" | "dfi" => Ok(SourceKind::CorporateEntity),
            _ => Err(ParseError::SourceKind(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Published,
    PublishFailed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Published => "published",
            RecordStatus::PublishFailed => "publish_failed",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "published" => Ok(RecordStatus::Published),
            "publish_failed" => Ok(RecordStatus::PublishFailed),
            invalid => Err(ParseError::RecordStatus(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

impl Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            invalid => Err(ParseError::BatchStatus(invalid.to_owned())),
        }
    }
}

/// One admitted logical record. Created once by the gate, never deleted, and
/// only its publish status ever changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub record_id: Uuid,
    pub content_hash: String,
    pub batch_id: Uuid,
    pub source_kind: SourceKind,
    pub source_origin: String,
    pub payload: Fields,
    pub status: RecordStatus,
    pub admitted_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub publish_error: Option<String>,
}

/// The row the gate attempts to insert.
#[derive(Debug, Clone)]
pub struct NewRawRecord {
    pub record_id: Uuid,
    pub content_hash: String,
    pub batch_id: Uuid,
    pub source_kind: SourceKind,
    pub source_origin: String,
    pub payload: Fields,
}

impl NewRawRecord {
    pub fn into_pending(self, admitted_at: DateTime<Utc>) -> RawRecord {
        RawRecord {
            record_id: self.record_id,
            content_hash: self.content_hash,
            batch_id: self.batch_id,
            source_kind: self.source_kind,
            source_origin: self.source_origin,
            payload: self.payload,
            status: RecordStatus::Pending,
            admitted_at,
            published_at: None,
            publish_error: None,
        }
    }
}

/// Audit entry for a rejected admission. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateEvent {
    pub event_id: Uuid,
    pub content_hash: String,
    pub existing_record_id: Uuid,
    pub batch_id: Uuid,
    pub detected_at: DateTime<Utc>,
}

/// One ingestion operation, i.e. one uploaded source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub batch_id: Uuid,
    pub source_kind: SourceKind,
    pub source_label: String,
    pub status: BatchStatus,
    pub total_seen: i64,
    pub admitted_count: i64,
    pub duplicate_count: i64,
    pub failed_count: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    // Set when, and only when, the batch failed
    pub error: Option<String>,
}

impl ImportBatch {
    pub fn new(batch_id: Uuid, source_kind: SourceKind, source_label: &str) -> Self {
        Self {
            batch_id,
            source_kind,
            source_label: source_label.to_owned(),
            status: BatchStatus::Running,
            total_seen: 0,
            admitted_count: 0,
            duplicate_count: 0,
            failed_count: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn counters_balanced(&self) -> bool {
        self.total_seen == self.admitted_count + self.duplicate_count + self.failed_count
    }

    /// Applies a single outcome to the counters, all four at once.
    pub fn apply(&mut self, outcome: RecordOutcome) {
        self.total_seen += 1;
        match outcome {
            RecordOutcome::Admitted => self.admitted_count += 1,
            RecordOutcome::Duplicate => self.duplicate_count += 1,
            RecordOutcome::Failed => self.failed_count += 1,
        }
    }
}

/// Aggregate over all batches, for the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub total_batches: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_seen: i64,
    pub admitted_count: i64,
    pub duplicate_count: i64,
    pub failed_count: i64,
}

/// Result of a gate admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Admitted(Uuid),
    Duplicate(Uuid),
}

impl Outcome {
    pub fn record_id(&self) -> Uuid {
        match self {
            Outcome::Admitted(id) | Outcome::Duplicate(id) => *id,
        }
    }
}

/// What the batch tracker counts for each record pulled from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Admitted,
    Duplicate,
    Failed,
}

impl From<Outcome> for RecordOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Admitted(_) => RecordOutcome::Admitted,
            Outcome::Duplicate(_) => RecordOutcome::Duplicate,
        }
    }
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Admitted => "admitted",
            RecordOutcome::Duplicate => "duplicate",
            RecordOutcome::Failed => "failed",
        }
    }
}
