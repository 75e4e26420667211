use async_trait::async_trait;

use crate::error::QueueError;

use super::{Queue, QueueMessage};

/// Prints every message as a line, for local runs without a broker.
pub struct StdoutQueue;

#[async_trait]
impl Queue for StdoutQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        println!("{} {}", message.destination, message.payload);
        Ok(())
    }
}
