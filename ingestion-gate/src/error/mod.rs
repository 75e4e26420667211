use thiserror::Error;
use uuid::Uuid;

use crate::types::BatchStatus;

/// Errors parsing our own enums back out of storage or requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0} is not a valid source kind")]
    SourceKind(String),
    #[error("{0} is not a valid record status")]
    RecordStatus(String),
    #[error("{0} is not a valid batch status")]
    BatchStatus(String),
}

/// A single record could not be normalized into its canonical identity.
/// Counted as a per-record failure, never fatal to the batch on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed record: field {field} {reason}")]
    MalformedRecord { field: String, reason: String },
}

impl NormalizeError {
    pub fn malformed(field: &str, reason: impl Into<String>) -> Self {
        NormalizeError::MalformedRecord {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Errors from the raw record store and batch store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage unavailable during {command}: {reason}")]
    StorageUnavailable { command: String, reason: String },
    #[error("batch {0} already exists")]
    DuplicateBatch(Uuid),
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("batch {batch_id} is {current}, cannot transition to {requested}")]
    InvalidTransition {
        batch_id: Uuid,
        current: BatchStatus,
        requested: BatchStatus,
    },
    #[error("record {0} not found")]
    RecordNotFound(Uuid),
    #[error("inconsistent storage state: {0}")]
    Inconsistent(String),
}

impl StoreError {
    pub fn unavailable(command: &str, reason: impl ToString) -> Self {
        StoreError::StorageUnavailable {
            command: command.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// Transient errors are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::StorageUnavailable { .. })
    }
}

impl From<ParseError> for StoreError {
    fn from(error: ParseError) -> Self {
        StoreError::Inconsistent(error.to_string())
    }
}

/// Errors returned by the deduplication gate for a single admission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    #[error(transparent)]
    Malformed(#[from] NormalizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmitError {
    pub fn is_transient(&self) -> bool {
        match self {
            AdmitError::Malformed(_) => false,
            AdmitError::Store(e) => e.is_transient(),
        }
    }
}

/// Errors handing a message to the queue broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("broker did not acknowledge message for {destination}: {reason}")]
    NotAcknowledged { destination: String, reason: String },
    #[error("failed to serialize message: {0}")]
    Serialization(String),
}

/// Errors from the downstream publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publishing record {record_id} failed after {attempts} attempts: {last_error}")]
    PublishExhausted {
        record_id: Uuid,
        attempts: u32,
        last_error: QueueError,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fatal error reading the source itself. Ends the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("failed to read source at record {index}: {reason}")]
    Read { index: u64, reason: String },
    #[error("source is not valid {format}: {reason}")]
    Format { format: String, reason: String },
}

/// Errors that stop a streaming ingest before the batch reaches a terminal state
/// on its own terms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("batch tracker failed: {0}")]
    Tracker(#[from] StoreError),
}
