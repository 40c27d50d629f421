//! Thread-safe FIFO queues used throughout the scan pipeline.
//!
//! A [`BoundedQueue`] connects the three pipeline threads: the input thread
//! pushes parsed targets into the capped staging buffer, the scheduler drains
//! it, and released reports travel to the result thread through an uncapped
//! instance. Probe results use small per-protocol instances inside a session.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Multi-producer multi-consumer FIFO with an optional capacity cap and a
/// stop signal.
///
/// When a capacity is set, `push` blocks until a consumer makes room. After
/// [`stop`](BoundedQueue::stop) producers no longer block and may still
/// append; consumers drain whatever remains and then observe the stop.
pub struct BoundedQueue<T> {
    inner: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

impl<T> BoundedQueue<T> {
    /// An unbounded queue; `push` never blocks.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// A queue capped at `capacity` items. A capacity of zero is treated as
    /// one so producers can always make progress.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends a value, blocking while the queue is at capacity. Returns
    /// whether the queue was still running when the value was appended.
    pub fn push(&self, value: T) -> bool {
        let mut state = self.inner.lock().unwrap();
        if let Some(cap) = self.capacity {
            while state.items.len() >= cap && !state.stopped {
                state = self.not_full.wait(state).unwrap();
            }
        }
        let running = !state.stopped;
        state.items.push_back(value);
        drop(state);
        self.not_empty.notify_one();
        running
    }

    /// Removes the front value without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.inner.lock().unwrap();
        let value = state.items.pop_front();
        drop(state);
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Removes the front value, blocking until one is available. Returns
    /// `None` once the queue is stopped and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.inner.lock().unwrap();
        loop {
            if let Some(value) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(value);
            }
            if state.stopped {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Signals shutdown and wakes every blocked producer and consumer.
    pub fn stop(&self) {
        let mut state = self.inner.lock().unwrap();
        state.stopped = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    /// Drains every queued value at once.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.inner.lock().unwrap();
        let drained = state.items.drain(..).collect();
        drop(state);
        self.not_full.notify_all();
        drained
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
