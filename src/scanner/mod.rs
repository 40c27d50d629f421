//! Scan orchestration: input thread, scheduler loop and result thread.
//!
//! The pipeline runs on three dedicated threads plus the two pools:
//!
//! * the **input thread** parses the source path and pushes targets into a
//!   bounded staging buffer, blocking when the scheduler falls behind;
//! * the **scheduler thread** owns the live session list. Each tick it
//!   releases finished sessions, feeds pending probes out of live ones and
//!   admits new targets, all under a per-tick quota that protects the file
//!   descriptor budget;
//! * the **result thread** drains released reports, writes them out
//!   (streaming or final) and periodically checkpoints progress.
//!
//! Backpressure is explicit at both ends: the staging buffer cap is the
//! only brake on the producer, and `quota`/`max_work_count` are the only
//! brakes on socket consumption. Nothing else in the pipeline is unbounded.

mod results;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info};

use crate::address::{self, is_ipv4_literal};
use crate::checkpoint::ProgressStore;
use crate::input::ScannerConfig;
use crate::latency::LatencyEstimator;
use crate::protocols::{self, Protocol};
use crate::queue::BoundedQueue;
use crate::reactor::ReactorPool;
use crate::resolver::{Resolve, SystemResolver};
use crate::session::{ProbeMode, ScanReport, ScanTarget, Session};
use crate::workers::WorkerPool;

/// Scheduler tick pause when there is nothing to do.
const TICK_SLEEP: Duration = Duration::from_millis(5);

/// Aggregate counters shared between the scheduler and result threads.
#[derive(Default)]
pub struct Stats {
    pub total_targets: AtomicU64,
    pub successful_ips: AtomicU64,
    pub dns_failed: AtomicU64,
    pub protocol_counts: Mutex<HashMap<String, u64>>,
    pub started: Mutex<Option<Instant>>,
    pub finished: Mutex<Option<Instant>>,
}

/// Snapshot of [`Stats`] for callers.
#[derive(Debug, Clone, Default)]
pub struct ScanStatistics {
    pub total_targets: u64,
    pub successful_ips: u64,
    pub dns_failed: u64,
    pub protocol_counts: HashMap<String, u64>,
    pub total_time: Duration,
}

pub struct Scanner {
    config: ScannerConfig,
    protocols: Vec<Arc<dyn Protocol>>,
    resolver: Arc<dyn Resolve>,
    latency: Arc<LatencyEstimator>,
    workers: Arc<WorkerPool>,
    reactors: Arc<ReactorPool>,
    staging: Arc<BoundedQueue<ScanTarget>>,
    result_queue: Arc<BoundedQueue<ScanReport>>,
    stop: Arc<AtomicBool>,
    input_done: Arc<AtomicBool>,
    scan_done: Arc<AtomicBool>,
    stats: Arc<Stats>,
    input_thread: Mutex<Option<JoinHandle<()>>>,
    scan_thread: Mutex<Option<JoinHandle<()>>>,
    result_thread: Mutex<Option<JoinHandle<Vec<ScanReport>>>>,
}

impl Scanner {
    /// Builds a scanner with the production resolver and the protocol set
    /// enabled in `config`.
    pub fn new(config: ScannerConfig) -> Self {
        let resolver = Arc::new(SystemResolver::new(
            config.dns_timeout,
            config.dns_max_mx_records,
        ));
        let names: Vec<&str> = config
            .enabled_protocols
            .iter()
            .map(String::as_str)
            .collect();
        let protocols = protocols::enabled_protocols(&names);
        Self::with_components(config, resolver, protocols)
    }

    /// Dependency-injecting constructor; tests drive the full pipeline with
    /// scripted resolvers and protocols.
    pub fn with_components(
        config: ScannerConfig,
        resolver: Arc<dyn Resolve>,
        protocols: Vec<Arc<dyn Protocol>>,
    ) -> Self {
        let workers = Arc::new(WorkerPool::new(config.cpu_thread_count));
        let reactors = Arc::new(ReactorPool::new(config.io_thread_count));
        info!(
            "thread pools initialized: IO={} CPU={}",
            reactors.size(),
            workers.size()
        );
        let staging = Arc::new(BoundedQueue::bounded(config.targets_max_size));

        Self {
            config,
            protocols,
            resolver,
            latency: Arc::new(LatencyEstimator::new()),
            workers,
            reactors,
            staging,
            result_queue: Arc::new(BoundedQueue::new()),
            stop: Arc::new(AtomicBool::new(false)),
            input_done: Arc::new(AtomicBool::new(false)),
            scan_done: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Stats::default()),
            input_thread: Mutex::new(None),
            scan_thread: Mutex::new(None),
            result_thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Starts the three pipeline threads against `source` (a target file or
    /// directory).
    pub fn start(&self, source: &Path) {
        *self.stats.started.lock().unwrap() = Some(Instant::now());

        if let Err(err) = std::fs::create_dir_all(&self.config.output_dir) {
            error!(
                "cannot create output dir {}: {err}",
                self.config.output_dir.display()
            );
        }

        let progress = ProgressStore::new(source, &self.config.output_dir);

        self.spawn_input_thread(source.to_path_buf(), &progress);

        let ctx = results::ResultContext {
            queue: Arc::clone(&self.result_queue),
            stop: Arc::clone(&self.stop),
            scan_done: Arc::clone(&self.scan_done),
            stats: Arc::clone(&self.stats),
            write_mode: self.config.output_write_mode,
            flush_interval: self.config.result_flush_interval,
            checkpoint_interval: self.config.checkpoint_interval,
            output_dir: self.config.output_dir.clone(),
            progress,
        };
        *self.result_thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("results".into())
                .spawn(move || results::run(ctx))
                .expect("failed to spawn result thread"),
        );

        self.spawn_scan_thread();

        info!("scanner started with input source: {}", source.display());
    }

    fn spawn_input_thread(&self, source: PathBuf, progress: &ProgressStore) {
        let staging = Arc::clone(&self.staging);
        let stop = Arc::clone(&self.stop);
        let input_done = Arc::clone(&self.input_done);
        let stats = Arc::clone(&self.stats);
        let offset = self.config.offset;
        let resume = progress.resume_point();

        let handle = thread::Builder::new()
            .name("input".into())
            .spawn(move || {
                let mut loaded = 0u64;
                let mut skipped = 0u64;
                let mut skip_until = resume.as_ref().map(|cp| cp.last_ip.clone());

                let mut enqueue = |token: String| -> bool {
                    if stop.load(Ordering::SeqCst) {
                        return false;
                    }
                    // Checkpoint skip mode: drop IPv4 tokens until the
                    // recorded resume point goes by. Domains always pass.
                    if let Some(last_ip) = &skip_until {
                        if is_ipv4_literal(&token) {
                            if token == *last_ip {
                                info!("resumed from checkpoint: {last_ip}");
                                skip_until = None;
                            } else {
                                skipped += 1;
                            }
                            return true;
                        }
                    }
                    if !staging.push(ScanTarget::from_token(token)) {
                        return false;
                    }
                    loaded += 1;
                    true
                };

                if let Err(err) = address::stream_targets(&source, offset, &mut enqueue) {
                    error!("failed to stream targets from {}: {err}", source.display());
                }

                if let Some(checkpoint) = resume {
                    info!("skipped {skipped} already-processed targets");
                    stats
                        .total_targets
                        .store(loaded + checkpoint.processed_count, Ordering::SeqCst);
                    stats
                        .successful_ips
                        .store(checkpoint.successful_count, Ordering::SeqCst);
                } else {
                    stats.total_targets.store(loaded, Ordering::SeqCst);
                }

                input_done.store(true, Ordering::SeqCst);
                info!(
                    "input parsing completed: {loaded} new targets loaded (total: {})",
                    stats.total_targets.load(Ordering::SeqCst)
                );
            })
            .expect("failed to spawn input thread");
        *self.input_thread.lock().unwrap() = Some(handle);
    }

    fn spawn_scan_thread(&self) {
        let config = self.config.clone();
        let protocols = self.protocols.clone();
        let resolver = Arc::clone(&self.resolver);
        let latency = Arc::clone(&self.latency);
        let workers = Arc::clone(&self.workers);
        let reactors = Arc::clone(&self.reactors);
        let staging = Arc::clone(&self.staging);
        let result_queue = Arc::clone(&self.result_queue);
        let stop = Arc::clone(&self.stop);
        let input_done = Arc::clone(&self.input_done);
        let scan_done = Arc::clone(&self.scan_done);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                scan_loop(
                    &config,
                    &protocols,
                    resolver.as_ref(),
                    &latency,
                    &workers,
                    &reactors,
                    &staging,
                    &result_queue,
                    &stop,
                    &input_done,
                );
                *stats.finished.lock().unwrap() = Some(Instant::now());
                scan_done.store(true, Ordering::SeqCst);
                info!("scan loop completed");
            })
            .expect("failed to spawn scheduler thread");
        *self.scan_thread.lock().unwrap() = Some(handle);
    }

    /// Waits for the pipeline to drain and returns the accumulated reports
    /// (empty in streaming mode, where the result thread already wrote
    /// them). Also shuts both pools down.
    pub fn get_results(&self) -> Vec<ScanReport> {
        if let Some(handle) = self.input_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.scan_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let reports = self
            .result_thread
            .lock()
            .unwrap()
            .take()
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default();

        self.workers.shutdown();
        self.reactors.shutdown();
        reports
    }

    /// Requests early termination; the scheduler honors it on its next tick.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.staging.stop();
        self.result_queue.stop();
    }

    pub fn statistics(&self) -> ScanStatistics {
        let protocol_counts = self.stats.protocol_counts.lock().unwrap().clone();
        let total_time = match (
            *self.stats.started.lock().unwrap(),
            *self.stats.finished.lock().unwrap(),
        ) {
            (Some(started), Some(finished)) => finished.duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        };
        ScanStatistics {
            total_targets: self.stats.total_targets.load(Ordering::SeqCst),
            successful_ips: self.stats.successful_ips.load(Ordering::SeqCst),
            dns_failed: self.stats.dns_failed.load(Ordering::SeqCst),
            protocol_counts,
            total_time,
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop();
        self.workers.shutdown();
        self.reactors.shutdown();
    }
}

/// The scheduler tick loop. Sole creator and releaser of sessions.
#[allow(clippy::too_many_arguments)]
fn scan_loop(
    config: &ScannerConfig,
    protocols: &[Arc<dyn Protocol>],
    resolver: &dyn Resolve,
    latency: &Arc<LatencyEstimator>,
    workers: &WorkerPool,
    reactors: &ReactorPool,
    staging: &BoundedQueue<ScanTarget>,
    result_queue: &BoundedQueue<ScanReport>,
    stop: &AtomicBool,
    input_done: &AtomicBool,
) {
    let mut sessions: Vec<Arc<Session>> = Vec::new();
    let probe_mode = if config.scan_all_ports {
        ProbeMode::AllAvailable
    } else {
        ProbeMode::ProtocolDefaults
    };
    let max_work = config.max_work_count.max(1);

    while !stop.load(Ordering::SeqCst) {
        let mut quota = config
            .batch_size
            .min(1.max(max_work.saturating_sub(sessions.len())));

        // Release pass: harvest every session whose predicate holds.
        sessions.retain(|session| {
            if session.ready_to_release() {
                result_queue.push(session.take_report(config.probe_timeout));
                false
            } else {
                true
            }
        });

        // Feed probes out of live sessions first.
        let io = reactors.tracked_handle();
        for session in &sessions {
            while quota > 0
                && Session::start_one_probe(session, protocols, workers, &io, config.probe_timeout)
            {
                quota -= 1;
            }
            if quota == 0 {
                break;
            }
        }

        // Admit new sessions while quota and the session cap allow.
        while quota > 0 && sessions.len() < max_work {
            let target = match staging.try_pop() {
                Some(target) => target,
                None => break,
            };
            let session = Arc::new(Session::new(
                target,
                resolver,
                config.dns_timeout,
                probe_mode,
                protocols,
                Arc::clone(latency),
                config.only_success,
            ));
            while quota > 0
                && Session::start_one_probe(&session, protocols, workers, &io, config.probe_timeout)
            {
                quota -= 1;
            }
            sessions.push(session);
        }

        let all_done =
            input_done.load(Ordering::SeqCst) && staging.is_empty() && sessions.is_empty();
        if all_done {
            break;
        }

        thread::sleep(TICK_SLEEP);
    }

    // A forced stop abandons live sessions; their in-flight probes die with
    // the reactor shutdown.
    if stop.load(Ordering::SeqCst) && !sessions.is_empty() {
        info!("stopping with {} sessions still alive", sessions.len());
    }
}
