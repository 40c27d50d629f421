//! Pool of single-threaded I/O reactors with load-aware task placement.
//!
//! Each reactor is a current-thread tokio runtime pinned to its own OS
//! thread. All socket and timer work for a probe runs on exactly one
//! reactor; nothing in the pool ever blocks on I/O from a worker thread.
//!
//! Placement is load-aware: every reactor carries a shared atomic counter of
//! tasks it has accepted but not yet finished, and [`ReactorPool::tracked_handle`]
//! returns a handle to the least-loaded reactor. When every counter reads
//! zero the pool falls back to round-robin so an idle fleet still spreads
//! work evenly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

/// Handle to one reactor that accounts for every task it spawns.
///
/// The pending counter is reference-counted and shared with the pool, so the
/// counter outlives every task that increments it regardless of shutdown
/// ordering.
#[derive(Clone)]
pub struct TrackedHandle {
    handle: Handle,
    pending: Arc<AtomicUsize>,
}

impl TrackedHandle {
    /// Spawns a future on the reactor, incrementing the pending count before
    /// the task is enqueued and decrementing it when the task finishes,
    /// panics included.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let gauge = PendingGuard::arm(Arc::clone(&self.pending));
        self.handle.spawn(async move {
            let _gauge = gauge;
            future.await;
        });
    }

    /// The underlying runtime handle, for callers that do their own
    /// completion accounting.
    pub fn runtime(&self) -> &Handle {
        &self.handle
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Increments on creation, decrements on drop. Drop runs even when the
/// wrapped task panics, keeping the load counter honest.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn arm(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Reactor {
    handle: Handle,
    pending: Arc<AtomicUsize>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A fleet of independent event loops, one OS thread each.
pub struct ReactorPool {
    reactors: Vec<Reactor>,
    round_robin: AtomicUsize,
    stopped: AtomicBool,
}

impl ReactorPool {
    /// Starts `count` reactors; a count of zero is clamped to one.
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let mut reactors = Vec::with_capacity(count);
        for index in 0..count {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build reactor runtime");
            let handle = runtime.handle().clone();
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            // Parking on the shutdown channel keeps the loop alive while it
            // services spawned tasks.
            let thread = thread::Builder::new()
                .name(format!("reactor-{index}"))
                .spawn(move || {
                    runtime.block_on(async {
                        let _ = shutdown_rx.await;
                    });
                })
                .expect("failed to spawn reactor thread");
            reactors.push(Reactor {
                handle,
                pending: Arc::new(AtomicUsize::new(0)),
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            });
        }
        debug!("reactor pool started with {count} event loops");
        Self {
            reactors,
            round_robin: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.reactors.len()
    }

    /// Returns a tracked handle to the least-loaded reactor. Ties go to the
    /// lowest index; a fully idle pool rotates round-robin instead.
    pub fn tracked_handle(&self) -> TrackedHandle {
        let index = self.choose_index();
        let reactor = &self.reactors[index];
        TrackedHandle {
            handle: reactor.handle.clone(),
            pending: Arc::clone(&reactor.pending),
        }
    }

    fn choose_index(&self) -> usize {
        let mut best = 0usize;
        let mut best_load = usize::MAX;
        let mut any_load = false;
        for (index, reactor) in self.reactors.iter().enumerate() {
            let load = reactor.pending.load(Ordering::Relaxed);
            if load > 0 {
                any_load = true;
            }
            if load < best_load {
                best = index;
                best_load = load;
            }
        }
        // With a fully idle fleet there is no selection pressure; rotate so
        // the first bursts spread out instead of pinning reactor zero.
        if !any_load {
            return self.round_robin.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        }
        best
    }

    /// Releases every work guard, stops the loops and joins the threads.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for reactor in &self.reactors {
            if let Some(tx) = reactor.shutdown.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
        for reactor in &self.reactors {
            if let Some(handle) = reactor.thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        debug!("reactor pool shut down");
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
