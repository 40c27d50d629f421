//! Fixed-size pool of OS threads for short CPU-bound jobs.
//!
//! The scheduler never touches sockets itself; it hands probe submission
//! closures to this pool, which in turn schedules the actual I/O onto a
//! reactor. Jobs are plain closures pulled from a shared [`BoundedQueue`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::queue::BoundedQueue;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Receiver side of one submitted job. Dropping it detaches the job.
pub struct JobHandle<T> {
    rx: mpsc::Receiver<thread::Result<T>>,
}

impl<T> JobHandle<T> {
    /// Blocks until the job has run. A panicking job surfaces here as
    /// `Err` with the panic payload; the worker that ran it survives.
    pub fn wait(self) -> thread::Result<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Box::new("worker pool shut down before the job ran")))
    }
}

/// Pool of worker threads draining a shared job queue.
///
/// A panicking job is caught and logged; the worker keeps running. Dropping
/// the pool shuts it down and joins every thread.
pub struct WorkerPool {
    jobs: Arc<BoundedQueue<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Spawns `count` workers; a count of zero is clamped to one.
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let jobs: Arc<BoundedQueue<Job>> = Arc::new(BoundedQueue::new());
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let queue = Arc::clone(&jobs);
            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{index}"))
                    .spawn(move || worker_loop(&queue))
                    .expect("failed to spawn worker thread"),
            );
        }
        debug!("worker pool started with {count} threads");
        Self {
            jobs,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        }
    }

    /// Enqueues a job and returns a handle to its outcome. Jobs submitted
    /// after shutdown are dropped once the workers have exited; their
    /// handles then report the shutdown.
    pub fn submit<F, T>(&self, job: F) -> JobHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.jobs.push(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job));
            if outcome.is_err() {
                warn!("worker job panicked; worker continues");
            }
            let _ = tx.send(outcome);
        }));
        JobHandle { rx }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Signals stop and joins all workers after they drain the queue. Safe
    /// to call more than once; later calls are no-ops.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.jobs.stop();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(jobs: &BoundedQueue<Job>) {
    while let Some(job) = jobs.pop() {
        // Submitted jobs already contain their own panic guard; this one
        // covers anything that slips through.
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("worker job panicked outside its guard");
        }
    }
}
