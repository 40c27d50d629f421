//! Per-target scan session: DNS, ordered probe queues and result bins.
//!
//! A session owns every piece of state tied to one target across all of its
//! probes. The scheduler creates it, feeds probes out of it one at a time,
//! and harvests it once its release predicate holds. Probe completions run
//! on reactor threads and only touch the session through atomic counters
//! and the thread-safe per-protocol result bins, so the scheduler can poll
//! with relaxed loads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;

use crate::address::is_ipv4_literal;
use crate::latency::LatencyEstimator;
use crate::protocols::{Port, Protocol, ProtocolResult};
use crate::queue::BoundedQueue;
use crate::reactor::TrackedHandle;
use crate::resolver::{DnsResult, Resolve};
use crate::workers::WorkerPool;

/// DNS retries after the initial attempt.
const DNS_RETRIES: usize = 2;

/// One unit of scan work as parsed from the input stream.
#[derive(Debug, Clone, Default)]
pub struct ScanTarget {
    pub domain: String,
    pub ip: String,
    pub mx_records: Vec<String>,
    pub priority: i32,
}

impl ScanTarget {
    /// Builds a target from one input token. IPv4 literals fill both the
    /// domain and ip fields; anything else resolves later.
    pub fn from_token(token: String) -> Self {
        let ip = if is_ipv4_literal(&token) {
            token.clone()
        } else {
            String::new()
        };
        Self {
            domain: token,
            ip,
            mx_records: Vec::new(),
            priority: 0,
        }
    }
}

/// Final per-target report handed to the result thread.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub target: ScanTarget,
    pub protocols: Vec<ProtocolResult>,
    pub total_time: Duration,
}

/// Port selection strategy for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Try every available port for every enabled protocol.
    AllAvailable,
    /// Only each protocol's own default ports.
    ProtocolDefaults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Pending = 0,
    DnsRunning = 1,
    ProbeRunning = 2,
    Completed = 3,
    Timeout = 4,
    Failed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::DnsRunning,
            2 => Self::ProbeRunning,
            3 => Self::Completed,
            4 => Self::Timeout,
            _ => Self::Failed,
        }
    }
}

/// All state for one target's scan lifecycle.
pub struct Session {
    target: ScanTarget,
    dns_result: DnsResult,
    state: AtomicU8,
    error: Mutex<String>,
    probe_mode: ProbeMode,
    available_ports: Vec<Port>,
    /// Per-protocol FIFO of ports still to probe, in enabled-protocol
    /// declaration order. That order also fixes which queue feeds the next
    /// probe, which keeps scheduling deterministic for a given queue state.
    port_queues: Mutex<Vec<(String, VecDeque<Port>)>>,
    /// Per-protocol bins collecting completed probe results.
    result_bins: Vec<(String, BoundedQueue<ProtocolResult>)>,
    tasks_total: AtomicUsize,
    tasks_completed: AtomicUsize,
    only_success: bool,
    latency: Arc<LatencyEstimator>,
}

impl Session {
    /// Resolves the target (synchronously, with retries) and lays out the
    /// probe queues according to `probe_mode`.
    pub fn new(
        target: ScanTarget,
        resolver: &dyn Resolve,
        dns_timeout: Duration,
        probe_mode: ProbeMode,
        protocols: &[Arc<dyn Protocol>],
        latency: Arc<LatencyEstimator>,
        only_success: bool,
    ) -> Self {
        let mut target = target;
        let mut dns_result = DnsResult::default();
        let state = AtomicU8::new(SessionState::Pending as u8);
        let mut error = String::new();

        if !target.ip.is_empty() {
            dns_result.domain = target.domain.clone();
            dns_result.ip = target.ip.clone();
            dns_result.success = true;
        } else if !target.domain.is_empty() {
            for attempt in 0..=DNS_RETRIES {
                dns_result = resolver.resolve(&target.domain, dns_timeout);
                if !dns_result.ip.is_empty() {
                    target.ip = dns_result.ip.clone();
                    break;
                }
                if attempt < DNS_RETRIES {
                    warn!(
                        "DNS resolution failed for {}, retrying ({}/{DNS_RETRIES})...",
                        target.domain,
                        attempt + 1
                    );
                }
            }
            if target.ip.is_empty() {
                warn!(
                    "DNS resolution failed for {} after {} attempts",
                    target.domain,
                    DNS_RETRIES + 1
                );
                state.store(SessionState::Failed as u8, Ordering::SeqCst);
                error = "DNS Resolution Failed".to_owned();
            }
        } else {
            dns_result.domain = target.domain.clone();
            dns_result.ip = target.ip.clone();
        }

        // Union of default ports over all enabled protocols, first-seen order.
        let mut available_ports: Vec<Port> = Vec::new();
        for protocol in protocols {
            for &port in protocol.default_ports() {
                if !available_ports.contains(&port) {
                    available_ports.push(port);
                }
            }
        }

        let mut port_queues = Vec::with_capacity(protocols.len());
        let mut result_bins = Vec::with_capacity(protocols.len());
        let mut total = 0usize;
        for protocol in protocols {
            let queue: VecDeque<Port> = match probe_mode {
                ProbeMode::ProtocolDefaults => protocol
                    .default_ports()
                    .iter()
                    .copied()
                    .filter(|port| available_ports.contains(port))
                    .collect(),
                ProbeMode::AllAvailable => available_ports.iter().copied().collect(),
            };
            total += queue.len();
            port_queues.push((protocol.name().to_owned(), queue));
            result_bins.push((protocol.name().to_owned(), BoundedQueue::new()));
        }

        Self {
            target,
            dns_result,
            state,
            error: Mutex::new(error),
            probe_mode,
            available_ports,
            port_queues: Mutex::new(port_queues),
            result_bins,
            tasks_total: AtomicUsize::new(total),
            tasks_completed: AtomicUsize::new(0),
            only_success,
            latency,
        }
    }

    pub fn domain(&self) -> &str {
        &self.target.domain
    }

    pub fn ip(&self) -> &str {
        &self.target.ip
    }

    pub fn dns_result(&self) -> &DnsResult {
        &self.dns_result
    }

    pub fn probe_mode(&self) -> ProbeMode {
        self.probe_mode
    }

    pub fn available_ports(&self) -> &[Port] {
        &self.available_ports
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn error_msg(&self) -> String {
        self.error.lock().unwrap().clone()
    }

    pub fn tasks_total(&self) -> usize {
        self.tasks_total.load(Ordering::Relaxed)
    }

    pub fn tasks_completed(&self) -> usize {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    /// Compare-and-swap state transition.
    pub fn set_state(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The scheduler may harvest this session when its DNS failed, it never
    /// had work, or every launched probe has completed.
    pub fn ready_to_release(&self) -> bool {
        if self.target.ip.is_empty() && !self.target.domain.is_empty() {
            return true;
        }
        if self.tasks_total() == 0 {
            return true;
        }
        self.tasks_completed() >= self.tasks_total()
    }

    /// Launches at most one probe: pops the first pending (protocol, port),
    /// resolves the effective deadline and hands the dial-and-exchange off
    /// to a reactor via the worker pool. Returns `false` when nothing is
    /// pending.
    pub fn start_one_probe(
        session: &Arc<Session>,
        protocols: &[Arc<dyn Protocol>],
        workers: &WorkerPool,
        io: &TrackedHandle,
        configured_timeout: Duration,
    ) -> bool {
        if session.target.ip.is_empty() {
            return false;
        }

        let (protocol_name, port) = {
            let mut queues = session.port_queues.lock().unwrap();
            match queues
                .iter_mut()
                .find(|(_, queue)| !queue.is_empty())
                .and_then(|(name, queue)| queue.pop_front().map(|port| (name.clone(), port)))
            {
                Some(next) => next,
                None => return false,
            }
        };

        let protocol = match protocols.iter().find(|p| p.name() == protocol_name) {
            Some(protocol) => Arc::clone(protocol),
            None => {
                warn!("protocol instance not found for {protocol_name}");
                return false;
            }
        };

        let timeout = if configured_timeout.is_zero() {
            session.latency.get_timeout(&session.target.ip)
        } else {
            configured_timeout
        };

        session.set_state(SessionState::Pending, SessionState::ProbeRunning);

        // Domains go on the wire (Host headers and the like); the IP is what
        // gets dialed.
        let host = if session.target.domain.is_empty() {
            session.target.ip.clone()
        } else {
            session.target.domain.clone()
        };
        let ip = session.target.ip.clone();
        let session = Arc::clone(session);
        let io = io.clone();

        workers.submit(move || {
            io.spawn(async move {
                let result = protocol.probe(&host, &ip, port, timeout).await;
                session.push_result(result);
            });
        });

        true
    }

    /// Completion callback: runs on a reactor thread once per probe.
    pub fn push_result(&self, result: ProtocolResult) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);

        if result.accessible && result.attrs.response_time_ms > 0.0 {
            self.latency.update(
                &self.target.ip,
                Duration::from_millis(result.attrs.response_time_ms as u64),
            );
        }

        if self.tasks_completed() >= self.tasks_total() {
            self.set_state(SessionState::ProbeRunning, SessionState::Completed);
        }

        if self.only_success && !result.accessible {
            return;
        }

        if let Some((_, bin)) = self
            .result_bins
            .iter()
            .find(|(name, _)| *name == result.protocol)
        {
            bin.push(result);
        }
    }

    /// Drains every protocol bin in declaration order.
    pub fn protocol_results(&self) -> Vec<ProtocolResult> {
        let mut results = Vec::new();
        for (_, bin) in &self.result_bins {
            results.extend(bin.drain());
        }
        results
    }

    /// Builds the final report. The scheduler calls this exactly once, after
    /// `ready_to_release` holds; no probe callback can still be running at
    /// that point because each one increments the completed counter exactly
    /// once before the scheduler observes it.
    pub fn take_report(&self, probe_timeout: Duration) -> ScanReport {
        ScanReport {
            target: ScanTarget {
                domain: self.target.domain.clone(),
                ip: self.dns_result.ip.clone(),
                mx_records: Vec::new(),
                priority: 0,
            },
            protocols: self.protocol_results(),
            total_time: probe_timeout,
        }
    }
}
