//! Shared helpers for the in-memory integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use ingestion_gate::{
    backoff::{BackoffPolicy, RetryPolicy},
    batch::BatchTracker,
    driver::{DriverPolicy, IngestDriver},
    gate::DedupGate,
    publish::{publish_channel, MemoryQueue, PublishWorker, Publisher},
    store::MemoryStore,
    types::Fields,
};
use serde_json::json;
use tokio::task::JoinHandle;

pub fn parcel(n: usize) -> Fields {
    let mut fields = Fields::new();
    fields.insert("STATEID".into(), json!(format!("WI-{n:07}")));
    fields.insert("PARCELID".into(), json!(format!("070/0810-{n}")));
    fields.insert("ADDNUM".into(), json!(n.to_string()));
    fields.insert("STREETNAME".into(), json!("Main"));
    fields.insert("STREETTYPE".into(), json!("St"));
    fields.insert("PLACENAME".into(), json!("Madison"));
    fields.insert("OWNERNME1".into(), json!("Jane Doe"));
    fields.insert("ASSESSYEAR".into(), json!("2024"));
    fields.insert("CNTASSDVALUE".into(), json!(250000.0));
    fields.insert("LOADDATE".into(), json!("2024-06-01T00:00:00Z"));
    fields
}

pub fn driver_policy() -> DriverPolicy {
    DriverPolicy {
        chunk_size: 50,
        storage_retry: RetryPolicy::new(3, BackoffPolicy::immediate()),
        max_consecutive_failures: 10,
    }
}

/// Store, queue and a running publish worker wired together like `main` does.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub tracker: BatchTracker,
    pub driver: Option<IngestDriver>,
    worker: JoinHandle<()>,
}

impl Harness {
    pub fn new(publish_attempts: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let tracker = BatchTracker::new(store.clone());
        let (sender, receiver) = publish_channel(64);
        let publisher = Publisher::new(
            store.clone(),
            queue.clone(),
            RetryPolicy::new(publish_attempts, BackoffPolicy::immediate()),
        );
        let worker = PublishWorker::new(publisher, receiver, 4).spawn();
        let driver = IngestDriver::new(
            DedupGate::new(store.clone()),
            tracker.clone(),
            Some(sender),
            driver_policy(),
        );

        Self {
            store,
            queue,
            tracker,
            driver: Some(driver),
            worker,
        }
    }

    pub fn driver(&self) -> &IngestDriver {
        self.driver.as_ref().expect("driver already dropped")
    }

    /// Drops the driver, the last publish sender, and waits for every queued
    /// publish to finish.
    pub async fn drain(mut self) -> (Arc<MemoryStore>, Arc<MemoryQueue>) {
        self.driver.take();
        self.worker.await.unwrap();
        (self.store, self.queue)
    }
}
