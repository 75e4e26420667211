//! Hand-off of admitted records to the downstream queue.
//!
//! A record moves `pending -> published` only after the broker acknowledged it.
//! Retries are bounded; once exhausted the record becomes `publish_failed` and a
//! copy goes to its kind's dead-letter destination.
use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    backoff::RetryPolicy,
    error::{PublishError, QueueError, StoreError},
    metrics_const::{
        DEAD_LETTER_COUNTER, PRODUCER_SEND_DURATION_HISTOGRAM, PUBLISHED_COUNTER,
        PUBLISH_ATTEMPT_COUNTER, PUBLISH_EXHAUSTED_COUNTER, REQUEUED_PENDING_COUNTER,
    },
    store::RecordStore,
    types::{Fields, RawRecord, RecordStatus, SourceKind},
};

pub mod kafka;
pub mod memory;
pub mod stdout;

pub use kafka::KafkaQueue;
pub use memory::MemoryQueue;
pub use stdout::StdoutQueue;

/// A message addressed to a named destination (a Kafka topic in production).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub destination: String,
    pub key: Option<String>,
    pub payload: String,
    pub headers: Vec<(String, String)>,
}

impl QueueMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Resolves only once the broker has durably acknowledged the message.
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// Body of every message we emit, normal and dead-lettered alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub record_id: Uuid,
    pub batch_id: Uuid,
    pub source_kind: SourceKind,
    pub content_hash: String,
    pub source_origin: String,
    pub admitted_at: DateTime<Utc>,
    pub payload: Fields,
}

impl From<&RawRecord> for RecordMessage {
    fn from(record: &RawRecord) -> Self {
        Self {
            record_id: record.record_id,
            batch_id: record.batch_id,
            source_kind: record.source_kind,
            content_hash: record.content_hash.clone(),
            source_origin: record.source_origin.clone(),
            admitted_at: record.admitted_at,
            payload: record.payload.clone(),
        }
    }
}

fn message_for(record: &RawRecord, destination: &str) -> Result<QueueMessage, QueueError> {
    let payload = serde_json::to_string(&RecordMessage::from(record))
        .map_err(|e| QueueError::Serialization(e.to_string()))?;

    Ok(QueueMessage {
        destination: destination.to_owned(),
        key: Some(record.record_id.to_string()),
        payload,
        headers: vec![
            ("record_id".to_owned(), record.record_id.to_string()),
            ("batch_id".to_owned(), record.batch_id.to_string()),
            ("source_kind".to_owned(), record.source_kind.to_string()),
        ],
    })
}

/// One admitted record waiting to be handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishRequest {
    pub record_id: Uuid,
    pub source_kind: SourceKind,
    pub batch_id: Uuid,
}

impl From<&RawRecord> for PublishRequest {
    fn from(record: &RawRecord) -> Self {
        Self {
            record_id: record.record_id,
            source_kind: record.source_kind,
            batch_id: record.batch_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishPolicy {
    pub retry: RetryPolicy,
    /// Publishes in flight at once in the worker.
    pub concurrency: usize,
}

pub type PublishSender = mpsc::Sender<PublishRequest>;
pub type PublishReceiver = mpsc::Receiver<PublishRequest>;

pub fn publish_channel(capacity: usize) -> (PublishSender, PublishReceiver) {
    mpsc::channel(capacity.max(1))
}

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn Queue>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<dyn Queue>, retry: RetryPolicy) -> Self {
        Self {
            store,
            queue,
            retry,
        }
    }

    /// Publishes one admitted record and returns its final status. A record that
    /// already left `pending` is left alone and its status returned as is.
    pub async fn publish(&self, request: PublishRequest) -> Result<RecordStatus, PublishError> {
        let record = self
            .store
            .get_record(request.record_id)
            .await?
            .ok_or(StoreError::RecordNotFound(request.record_id))?;

        if record.status != RecordStatus::Pending {
            return Ok(record.status);
        }

        let destination = record.source_kind.destination();
        let message = message_for(&record, destination)?;
        let attempts = self.retry.attempts();
        let mut last_error = None;

        for attempt in 0..attempts {
            let start = Instant::now();
            match self.queue.publish(&message).await {
                Ok(()) => {
                    metrics::histogram!(PRODUCER_SEND_DURATION_HISTOGRAM)
                        .record(start.elapsed().as_secs_f64());
                    metrics::counter!(PUBLISH_ATTEMPT_COUNTER, "destination" => destination, "result" => "success")
                        .increment(1);
                    // Acked but not marked: the record stays pending and is
                    // published again after a restart
                    self.store
                        .finish_publish(record.record_id, RecordStatus::Published, None)
                        .await?;
                    metrics::counter!(PUBLISHED_COUNTER).increment(1);
                    return Ok(RecordStatus::Published);
                }
                Err(e) => {
                    metrics::counter!(PUBLISH_ATTEMPT_COUNTER, "destination" => destination, "result" => "failure")
                        .increment(1);
                    warn!(
                        record_id = %record.record_id,
                        destination,
                        attempt = attempt + 1,
                        attempts,
                        "publish attempt failed: {}", e
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.backoff.next_delay(attempt)).await;
                    }
                }
            }
        }

        let last_error = last_error.unwrap_or_else(|| QueueError::NotAcknowledged {
            destination: destination.to_owned(),
            reason: "no attempt made".to_owned(),
        });
        self.exhausted(&record, attempts, last_error).await
    }

    async fn exhausted(
        &self,
        record: &RawRecord,
        attempts: u32,
        last_error: QueueError,
    ) -> Result<RecordStatus, PublishError> {
        metrics::counter!(PUBLISH_EXHAUSTED_COUNTER).increment(1);
        let reason = last_error.to_string();
        error!(
            record_id = %record.record_id,
            batch_id = %record.batch_id,
            attempts,
            "publishing exhausted retries, dead-lettering: {}", reason
        );

        self.store
            .finish_publish(record.record_id, RecordStatus::PublishFailed, Some(&reason))
            .await?;

        let dead_letter = record.source_kind.dead_letter_destination();
        let mut message = message_for(record, dead_letter)?;
        message.headers.push(("error".to_owned(), reason));
        message
            .headers
            .push(("attempts".to_owned(), attempts.to_string()));

        // The row is already publish_failed with its payload, so a lost
        // dead-letter copy can still be repaired from storage
        match self.queue.publish(&message).await {
            Ok(()) => {
                metrics::counter!(DEAD_LETTER_COUNTER, "result" => "success").increment(1);
            }
            Err(e) => {
                metrics::counter!(DEAD_LETTER_COUNTER, "result" => "failure").increment(1);
                error!(
                    record_id = %record.record_id,
                    destination = dead_letter,
                    "failed to dead-letter record: {}", e
                );
            }
        }

        Err(PublishError::PublishExhausted {
            record_id: record.record_id,
            attempts,
            last_error,
        })
    }
}

/// Drains publish requests from the drivers, running up to `concurrency`
/// publishes at once. Finishes once every sender is dropped and all in-flight
/// publishes are done.
pub struct PublishWorker {
    publisher: Publisher,
    receiver: PublishReceiver,
    concurrency: usize,
}

impl PublishWorker {
    pub fn new(publisher: Publisher, receiver: PublishReceiver, concurrency: usize) -> Self {
        Self {
            publisher,
            receiver,
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut in_flight = JoinSet::new();

        while let Some(request) = self.receiver.recv().await {
            while in_flight.len() >= self.concurrency {
                if let Some(Err(e)) = in_flight.join_next().await {
                    error!("publish task panicked: {:?}", e);
                }
            }

            let publisher = self.publisher.clone();
            in_flight.spawn(async move {
                // Exhaustion is already logged and dead-lettered by the publisher
                if let Err(e) = publisher.publish(request).await {
                    if !matches!(e, PublishError::PublishExhausted { .. }) {
                        error!(record_id = %request.record_id, "publish failed: {}", e);
                    }
                }
            });
        }

        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                error!("publish task panicked: {:?}", e);
            }
        }
        info!("publish worker drained");
    }
}

/// Queues every record still `pending`, oldest first. Meant to run once at
/// startup, before any driver can admit new records, since a crash between
/// admission and acknowledgement leaves records pending.
pub async fn requeue_pending(
    store: &dyn RecordStore,
    sender: &PublishSender,
    limit: i64,
) -> Result<usize, StoreError> {
    let pending = store.records_with_status(RecordStatus::Pending, limit).await?;
    let mut queued = 0;

    for record in &pending {
        if sender.send(PublishRequest::from(record)).await.is_err() {
            warn!("publish channel closed while requeueing pending records");
            break;
        }
        queued += 1;
    }

    metrics::counter!(REQUEUED_PENDING_COUNTER).increment(queued as u64);
    if queued > 0 {
        info!(count = queued, "requeued pending records");
    }
    Ok(queued)
}
