//! Bounded multi-producer/multi-consumer FIFO with batched gets and close
//! semantics. The two instances of this queue (changes and reports) are the
//! only mutable structures shared between replication subtasks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue is full")]
    Full,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    // Waiters re-check state after every wake; see the put/get loops.
    not_empty: Notify,
    not_full: Notify,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A closeable FIFO which can hand out multiple items per `get` call.
///
/// Once closed no further puts are accepted; getters drain whatever remains
/// and then observe `None`, the closed sentinel.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
    capacity: Option<usize>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            shared: self.shared.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue requires non-zero capacity");
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        WorkQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one item, waiting while the queue is at capacity.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        let mut item = Some(item);
        loop {
            // The waiter must register before the state re-check, or a wake
            // issued between the two would be lost.
            let mut notified = std::pin::pin!(self.shared.not_full.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if self.has_room(&state) {
                    state.items.push_back(item.take().unwrap());
                    self.shared.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Enqueue one item without waiting.
    pub fn put_nowait(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if !self.has_room(&state) {
            return Err(QueueError::Full);
        }
        state.items.push_back(item);
        self.shared.not_empty.notify_waiters();
        Ok(())
    }

    /// Dequeue up to `max_items` items in FIFO order, waiting while the
    /// queue is empty and open. Returns `None` once the queue is closed and
    /// fully drained.
    ///
    /// The batch is capped by the current depth, never padded by waiting for
    /// more items to arrive.
    pub async fn get(&self, max_items: usize) -> Option<Vec<T>> {
        let max_items = max_items.max(1);
        loop {
            let mut notified = std::pin::pin!(self.shared.not_empty.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().unwrap();
                if !state.items.is_empty() {
                    let n = max_items.min(state.items.len());
                    let batch = state.items.drain(..n).collect();
                    self.shared.not_full.notify_waiters();
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Dequeue everything currently buffered, waiting only when the queue is
    /// empty and open.
    pub async fn get_all(&self) -> Option<Vec<T>> {
        self.get(usize::MAX).await
    }

    /// Close the queue. Idempotent. Pending producers fail with
    /// [`QueueError::Closed`]; getters drain the remaining items and then
    /// observe the closed sentinel.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_waiters();
        self.shared.not_full.notify_waiters();
    }

    fn has_room(&self, state: &State<T>) -> bool {
        self.capacity.map_or(true, |cap| state.items.len() < cap)
    }
}
