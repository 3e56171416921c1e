//! Fixed pool of worker threads draining a [`ConnectionQueue`].

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use super::ConnectionQueue;

/// Worker threads, each owning one handler built by the pool's factory.
pub struct ThreadPool {
    workers: Vec<Worker>,
}

impl ThreadPool {
    /// Start `size` workers.
    ///
    /// Every worker calls `make_handler(id)` once on its own thread, then
    /// feeds it items from `queue` until the queue is closed and drained.
    /// The queue's live-worker count covers each thread from spawn to exit.
    /// If a thread cannot be started, the queue is closed and the workers
    /// already running are joined before the error is returned.
    pub fn spawn<T, F, H>(size: usize, queue: Arc<ConnectionQueue<T>>, make_handler: F) -> io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(usize) -> H + Send + Sync + 'static,
        H: FnMut(T),
    {
        Self::spawn_with(size, queue, make_handler, |id| {
            thread::Builder::new().name(format!("embedserve-worker-{id}"))
        })
    }

    fn spawn_with<T, F, H, B>(
        size: usize,
        queue: Arc<ConnectionQueue<T>>,
        make_handler: F,
        builder: B,
    ) -> io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(usize) -> H + Send + Sync + 'static,
        H: FnMut(T),
        B: Fn(usize) -> thread::Builder,
    {
        assert!(size > 0);

        let make_handler = Arc::new(make_handler);
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            queue.worker_started();
            match Worker::new(id, builder(id), Arc::clone(&queue), Arc::clone(&make_handler)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    queue.worker_exited();
                    queue.close();
                    Self { workers }.join();
                    tracing::error!(worker = id, error = %e, "failed to start worker thread");
                    return Err(e);
                }
            }
        }

        Ok(Self { workers })
    }

    /// Number of threads in the pool.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker thread to finish.
    pub fn join(&mut self) {
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::error!(worker = worker.id, "worker thread panicked");
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

/// Decrements the live count however the worker leaves.
struct ExitGuard<T> {
    queue: Arc<ConnectionQueue<T>>,
}

impl<T> Drop for ExitGuard<T> {
    fn drop(&mut self) {
        self.queue.worker_exited();
    }
}

impl Worker {
    fn new<T, F, H>(
        id: usize,
        builder: thread::Builder,
        queue: Arc<ConnectionQueue<T>>,
        make_handler: Arc<F>,
    ) -> io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(usize) -> H + Send + Sync + 'static,
        H: FnMut(T),
    {
        let thread = builder.spawn(move || {
            let guard = ExitGuard { queue };
            let mut handler = make_handler(id);
            while let Some(item) = guard.queue.pop() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(item)));
                if outcome.is_err() {
                    tracing::error!(worker = id, "panic recovered while serving a connection");
                }
            }
            tracing::debug!(worker = id, "worker exiting");
        })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn every_item_is_processed_exactly_once() {
        const CAPACITY: usize = 4;
        const WORKERS: usize = 3;
        let total = CAPACITY + 5;

        let queue = Arc::new(ConnectionQueue::new(CAPACITY));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pool = {
            let seen = Arc::clone(&seen);
            ThreadPool::spawn(WORKERS, Arc::clone(&queue), move |_id| {
                let seen = Arc::clone(&seen);
                move |item: usize| {
                    thread::sleep(Duration::from_millis(5));
                    seen.lock().unwrap().push(item);
                }
            })
            .unwrap()
        };
        assert_eq!(pool.size(), WORKERS);

        let producers: Vec<_> = (0..total)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.push(i).unwrap())
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        queue.close();
        queue.wait_workers();
        pool.join();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), total, "no connection lost or duplicated");
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique, (0..total).collect());
    }

    #[test]
    fn producer_stalls_while_workers_are_saturated() {
        const CAPACITY: usize = 2;
        let queue = Arc::new(ConnectionQueue::new(CAPACITY));
        let release = Arc::new(Mutex::new(()));
        let gate = release.lock().unwrap();
        let started = Arc::new(AtomicUsize::new(0));

        let mut pool = {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            ThreadPool::spawn(1, Arc::clone(&queue), move |_| {
                let release = Arc::clone(&release);
                let started = Arc::clone(&started);
                move |_item: usize| {
                    started.fetch_add(1, Ordering::SeqCst);
                    drop(release.lock().unwrap());
                }
            })
            .unwrap()
        };

        let pushed = Arc::new(AtomicUsize::new(0));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                for i in 0..CAPACITY + 5 {
                    queue.push(i).unwrap();
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(200));
        // One item held by the blocked worker plus a full queue.
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pushed.load(Ordering::SeqCst), CAPACITY + 1);
        assert_eq!(queue.len(), CAPACITY);

        drop(gate);
        producer.join().unwrap();
        queue.close();
        queue.wait_workers();
        pool.join();
        assert_eq!(started.load(Ordering::SeqCst), CAPACITY + 5);
    }

    #[test]
    fn failed_spawn_stops_started_workers() {
        let queue = Arc::new(ConnectionQueue::new(4));
        // No address space can hold this stack, so the third thread fails.
        let pool = ThreadPool::spawn_with(
            3,
            Arc::clone(&queue),
            |_| |_item: u32| {},
            |id| {
                let builder = thread::Builder::new();
                if id == 2 { builder.stack_size(1 << 48) } else { builder }
            },
        );
        assert!(pool.is_err());
        assert_eq!(queue.live_workers(), 0);
        assert_eq!(queue.push(7), Err(7));
    }

    #[test]
    fn panicking_handler_does_not_kill_the_worker() {
        let queue = Arc::new(ConnectionQueue::new(4));
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = {
            let done = Arc::clone(&done);
            ThreadPool::spawn(1, Arc::clone(&queue), move |_| {
                let done = Arc::clone(&done);
                move |item: u32| {
                    if item == 0 {
                        panic!("boom");
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
        };
        queue.push(0).unwrap();
        queue.push(1).unwrap();
        queue.close();
        queue.wait_workers();
        pool.join();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(queue.live_workers(), 0);
    }
}
