//! Blocking priority queue.
//!
//! Used for the controller's input events and for the compilation workers'
//! job queue. Higher priority is served first; equal priorities are served
//! in insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{Condvar, Mutex};

// =============================================================================
// Entry
// =============================================================================

#[derive(Debug)]
struct Entry<T> {
    priority: f64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// =============================================================================
// Priority Queue
// =============================================================================

#[derive(Debug)]
struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    shutdown: bool,
}

/// Thread-safe max-priority queue with blocking take.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Enqueue `item`. Returns `false` (dropping the item) after shutdown.
    pub fn insert(&self, priority: f64, item: T) -> bool {
        self.try_insert(priority, item).is_ok()
    }

    /// Enqueue `item`, handing it back after shutdown.
    pub fn try_insert(&self, priority: f64, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(item);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry { priority, seq, item });
        self.condvar.notify_one();
        Ok(())
    }

    /// Wait for and remove the highest-priority item.
    ///
    /// Returns `None` once the queue is shut down.
    pub fn take(&self) -> Option<(f64, T)> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(entry) = state.heap.pop() {
                return Some((entry.priority, entry.item));
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Remove the highest-priority item without blocking.
    pub fn try_take(&self) -> Option<(f64, T)> {
        self.state
            .lock()
            .heap
            .pop()
            .map(|entry| (entry.priority, entry.item))
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter and refuse further items.
    ///
    /// Pending items are handed back in priority order so the caller can
    /// release whatever is waiting on them. A second call returns nothing.
    pub fn shutdown(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.shutdown = true;
        let mut pending = Vec::with_capacity(state.heap.len());
        while let Some(entry) = state.heap.pop() {
            pending.push(entry.item);
        }
        self.condvar.notify_all();
        pending
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
