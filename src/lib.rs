//! This crate exposes the internal functionality of the bannerscan
//! service scanner.
//!
//! bannerscan resolves a stream of targets (domains, IPv4 addresses, CIDR
//! blocks, ranges) and runs short banner/capability exchanges against each
//! one — SMTP, POP3, IMAP, HTTP, FTP, Telnet and SSH — at a concurrency
//! bounded only by the process file-descriptor budget. It is built for
//! million-target runs on a single host.
//!
//! ## Architecture Overview
//!
//! The scan is driven by [`scanner::Scanner`], which wires together three
//! pipeline threads and two execution pools:
//!
//! 1. **Input**: [`address`] streams and expands the target source into a
//!    bounded staging buffer ([`queue::BoundedQueue`])
//! 2. **Scheduling**: the scheduler thread turns targets into
//!    [`session::Session`]s and feeds probes under a file-descriptor-aware
//!    quota
//! 3. **Probing**: [`workers::WorkerPool`] submits each probe onto the
//!    least-loaded event loop of [`reactor::ReactorPool`], where the
//!    protocol implementations in [`protocols`] run their exchanges
//! 4. **Timeouts**: [`latency::LatencyEstimator`] adapts probe deadlines
//!    per /24 when no fixed timeout is configured
//! 5. **Results**: the result thread writes reports out and periodically
//!    persists a [`checkpoint`] for crash resume
//!
//! ## Basic Usage Example
//!
//! ```no_run
//! use bannerscan::input::ScannerConfig;
//! use bannerscan::scanner::Scanner;
//! use std::path::Path;
//!
//! let config = ScannerConfig::default();
//! let scanner = Scanner::new(config);
//! scanner.start(Path::new("targets.txt"));
//! let reports = scanner.get_results();
//! println!("scanned {} targets", reports.len());
//! ```

pub mod address;

pub mod checkpoint;

pub mod input;

pub mod latency;

pub mod output;

pub mod preflight;

pub mod protocols;

pub mod queue;

pub mod reactor;

pub mod resolver;

pub mod scanner;

pub mod session;

pub mod vendor;

pub mod workers;
