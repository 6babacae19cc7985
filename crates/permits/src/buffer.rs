//! Bounded FIFO between the submission gate and the dispatch workers
//!
//! Insertion never waits: a full buffer is reported back immediately so the
//! caller sees backpressure. Removal waits for the next item and is shared by
//! every dispatch worker.

use tokio::sync::{mpsc, Mutex};

/// Fixed-capacity multi-consumer FIFO
pub(crate) struct BoundedBuffer<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items
    ///
    /// `capacity` must be non-zero; the dispatcher validates it first.
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Insert without waiting, handing the item back if the buffer is full
    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => item,
        })
    }

    /// Wait for the next item in submission order
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub(crate) async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Maximum number of buffered items
    pub(crate) fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of items currently buffered
    pub(crate) fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let buffer = BoundedBuffer::new(4);
        for i in 0..4 {
            buffer.try_push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(buffer.pop().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let buffer = BoundedBuffer::new(2);
        buffer.try_push("a").unwrap();
        buffer.try_push("b").unwrap();
        assert_eq!(buffer.try_push("c"), Err("c"));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.capacity(), 2);

        buffer.pop().await;
        assert_eq!(buffer.len(), 1);
        buffer.try_push("c").unwrap();
    }

    #[tokio::test]
    async fn test_pop_waits_for_item() {
        use std::sync::Arc;

        let buffer = Arc::new(BoundedBuffer::new(1));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::task::yield_now().await;
        assert!(!consumer.is_finished());

        buffer.try_push(9).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(9));
    }
}
