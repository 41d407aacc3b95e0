//! Bounded write queue.
//!
//! Asynchronous writes are queued as operations and applied by the index's
//! drain tasks. Once `capacity` operations are waiting, submitters wait for
//! room instead of piling up more.

use super::error::IndexError;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

/// Default number of pending writes before submitters block.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

pub struct WriteQueue<T> {
    capacity: usize,
    sender: RwLock<Option<mpsc::Sender<T>>>,
    receiver: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T: Send + 'static> WriteQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            capacity,
            sender: RwLock::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Queue `op`, waiting while the queue is full.
    pub async fn push(&self, op: T) -> Result<(), IndexError> {
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(IndexError::QueueClosed)?;
        sender.send(op).await.map_err(|_| IndexError::QueueClosed)
    }

    /// The draining end; handed out once.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<T>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations queued but not yet taken by a drain task. 0 once closed.
    pub fn pending(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |sender| self.capacity - sender.capacity())
    }

    /// Reject further submissions. Operations already queued are still
    /// delivered, and the receiver ends once they are drained.
    pub fn close(&self) -> bool {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_saturate_the_queue_and_wait() {
        let queue = Arc::new(WriteQueue::new(4));
        let writers: Vec<_> = (0..12u32)
            .map(|n| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.push(n).await })
            })
            .collect();

        settle(|| queue.pending() == queue.capacity()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), 4);
        assert_eq!(writers.iter().filter(|w| w.is_finished()).count(), 4);

        let mut receiver = queue.take_receiver().unwrap();
        let mut seen = Vec::new();
        while seen.len() < 12 {
            seen.push(receiver.recv().await.unwrap());
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn closing_rejects_new_writes_but_delivers_queued_ones() {
        let queue = WriteQueue::new(2);
        queue.push(1u8).await.unwrap();
        assert!(queue.close());
        assert!(!queue.close());
        assert_eq!(queue.push(2).await, Err(IndexError::QueueClosed));

        let mut receiver = queue.take_receiver().unwrap();
        assert!(queue.take_receiver().is_none());
        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, None);
    }
}
