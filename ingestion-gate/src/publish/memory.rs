use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;

use crate::error::QueueError;

use super::{Queue, QueueMessage};

#[derive(Default)]
struct State {
    delivered: Vec<QueueMessage>,
    rejected_destinations: HashSet<String>,
}

/// Queue that keeps acknowledged messages in memory, with switches to make the
/// "broker" refuse acknowledgement.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    attempts: AtomicU32,
    reject_next: AtomicU32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses the next `count` publish attempts, whatever their destination.
    pub fn reject_next(&self, count: u32) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    /// Refuses every publish to `destination` from now on.
    pub fn reject_destination(&self, destination: &str) {
        self.lock()
            .rejected_destinations
            .insert(destination.to_owned());
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<QueueMessage> {
        self.lock().delivered.clone()
    }

    pub fn messages_for(&self, destination: &str) -> Vec<QueueMessage> {
        self.lock()
            .delivered
            .iter()
            .filter(|m| m.destination == destination)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let mut state = self.lock();
        if injected || state.rejected_destinations.contains(&message.destination) {
            return Err(QueueError::NotAcknowledged {
                destination: message.destination.clone(),
                reason: "broker rejected message".to_owned(),
            });
        }

        state.delivered.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(destination: &str) -> QueueMessage {
        QueueMessage {
            destination: destination.to_owned(),
            key: None,
            payload: "{}".to_owned(),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_rejections() {
        let queue = MemoryQueue::new();
        queue.reject_next(1);
        queue.reject_destination("closed");

        assert!(queue.publish(&message("open")).await.is_err());
        assert!(queue.publish(&message("open")).await.is_ok());
        assert!(queue.publish(&message("closed")).await.is_err());

        assert_eq!(queue.attempts(), 3);
        assert_eq!(queue.messages(), vec![message("open")]);
    }
}
