//! Bounded hand-off queue between the accept loop and the worker pool.
//!
//! One mutex guards the ring and the live-worker count. Three condition
//! variables hang off it: `not_full` (producer waits), `not_empty` (workers
//! wait) and `all_done` (shutdown waits for the last worker to leave).

use std::sync::{Condvar, Mutex, MutexGuard};

struct State<T> {
    slots: Vec<Option<T>>,
    /// Total items ever pushed.
    head: u64,
    /// Total items ever popped. `tail <= head` and `head - tail <= capacity`.
    tail: u64,
    closed: bool,
    live_workers: usize,
}

impl<T> State<T> {
    fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    fn index(&self, counter: u64) -> usize {
        (counter % self.slots.len() as u64) as usize
    }
}

/// Fixed-capacity blocking queue with a close signal.
pub struct ConnectionQueue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    all_done: Condvar,
}

impl<T> ConnectionQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(State {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                closed: false,
                live_workers: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Poisoning is ignored: no critical section can panic half-way.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue, blocking while the queue is full.
    ///
    /// Returns the item back if the queue was closed before space appeared.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        while state.len() == state.slots.len() && !state.closed {
            state = self.not_full.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.closed {
            return Err(item);
        }
        let slot = state.index(state.head);
        state.slots[slot] = Some(item);
        state.head += 1;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while the queue is empty.
    ///
    /// Items still queued at close are handed out; `None` means closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        while state.head == state.tail && !state.closed {
            state = self.not_empty.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.head == state.tail {
            return None;
        }
        let slot = state.index(state.tail);
        let item = state.slots[slot].take();
        state.tail += 1;
        self.not_full.notify_one();
        item
    }

    /// Refuse further pushes and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Record a worker thread entering service.
    pub fn worker_started(&self) {
        self.lock().live_workers += 1;
    }

    /// Record a worker thread leaving; wakes [`ConnectionQueue::wait_workers`] at zero.
    pub fn worker_exited(&self) {
        let mut state = self.lock();
        state.live_workers = state.live_workers.saturating_sub(1);
        if state.live_workers == 0 {
            self.all_done.notify_all();
        }
    }

    /// Number of workers currently in service.
    pub fn live_workers(&self) -> usize {
        self.lock().live_workers
    }

    /// Block until every started worker has exited.
    pub fn wait_workers(&self) {
        let mut state = self.lock();
        while state.live_workers > 0 {
            state = self.all_done.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}
