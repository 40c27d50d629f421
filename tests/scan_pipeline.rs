//! End-to-end pipeline tests with scripted DNS and protocol probes.
//!
//! These drive the real input thread, scheduler, session machinery, pools
//! and result thread; only the network edges (resolver, probe exchanges)
//! are stubbed out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bannerscan::checkpoint::{utc_timestamp, CheckpointInfo, ProgressStore};
use bannerscan::input::{ScannerConfig, WriteMode};
use bannerscan::output::{OutputFormat, ResultHandler};
use bannerscan::protocols::{Port, Protocol, ProtocolAttributes, ProtocolResult};
use bannerscan::resolver::{DnsResult, Resolve};
use bannerscan::scanner::Scanner;

struct ScriptedResolver {
    answers: HashMap<String, String>,
}

impl ScriptedResolver {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            answers: HashMap::new(),
        })
    }

    fn with(pairs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            answers: pairs
                .iter()
                .map(|(d, ip)| ((*d).to_owned(), (*ip).to_owned()))
                .collect(),
        })
    }
}

impl Resolve for ScriptedResolver {
    fn resolve(&self, domain: &str, _timeout: Duration) -> DnsResult {
        match self.answers.get(domain) {
            Some(ip) => DnsResult {
                domain: domain.to_owned(),
                ip: ip.clone(),
                success: true,
                ..DnsResult::default()
            },
            None => DnsResult {
                domain: domain.to_owned(),
                error: "NXDOMAIN".to_owned(),
                ..DnsResult::default()
            },
        }
    }
}

/// Probe double that answers instantly and counts how many probes ran.
struct StubProtocol {
    name: &'static str,
    ports: &'static [Port],
    accessible: bool,
    probes: Arc<AtomicUsize>,
}

impl StubProtocol {
    fn accessible(name: &'static str, ports: &'static [Port]) -> (Arc<dyn Protocol>, Arc<AtomicUsize>) {
        let probes = Arc::new(AtomicUsize::new(0));
        let protocol: Arc<dyn Protocol> = Arc::new(Self {
            name,
            ports,
            accessible: true,
            probes: Arc::clone(&probes),
        });
        (protocol, probes)
    }
}

#[async_trait]
impl Protocol for StubProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn default_ports(&self) -> &'static [Port] {
        self.ports
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, _timeout: Duration) -> ProtocolResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let mut result = ProtocolResult {
            protocol: self.name.to_owned(),
            host: host.to_owned(),
            port,
            accessible: self.accessible,
            ..ProtocolResult::default()
        };
        if self.accessible {
            result.attrs.banner = format!("220 {ip} ready");
            result.attrs.response_time_ms = 5.0;
        } else {
            result.error = format!("{} probe timed out", self.name);
        }
        result
    }

    fn parse_capabilities(&self, _response: &str, _attrs: &mut ProtocolAttributes) {}
}

fn test_config(output_dir: &Path) -> ScannerConfig {
    ScannerConfig {
        io_thread_count: 2,
        cpu_thread_count: 2,
        batch_size: 64,
        targets_max_size: 128,
        max_work_count: 32,
        probe_timeout: Duration::from_millis(500),
        result_flush_interval: Duration::from_millis(20),
        output_write_mode: WriteMode::Final,
        checkpoint_interval: 1_000_000,
        output_dir: output_dir.to_path_buf(),
        ..ScannerConfig::default()
    }
}

fn write_targets(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("targets.txt");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn empty_input_produces_zero_reports_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "# nothing here\n\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();

    assert!(reports.is_empty());
    assert_eq!(scanner.statistics().total_targets, 0);
}

#[test]
fn cidr_input_yields_exactly_one_report_per_target() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.0.0.0/30\n");
    let (protocol, probes) = StubProtocol::accessible("SMTP", &[25, 587]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();

    assert_eq!(reports.len(), 4);
    let mut ips: Vec<_> = reports.iter().map(|r| r.target.ip.clone()).collect();
    ips.sort();
    assert_eq!(ips, ["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    // Two ports per target, one probe each, exactly once.
    assert_eq!(probes.load(Ordering::SeqCst), 8);
    for report in &reports {
        assert_eq!(report.protocols.len(), 2);
        assert!(report.protocols.iter().all(|pr| pr.accessible));
    }
}

#[test]
fn failing_resolver_produces_one_empty_report() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "dead.example\n");
    let (protocol, probes) = StubProtocol::accessible("SMTP", &[25]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].target.ip.is_empty());
    assert!(reports[0].protocols.is_empty());
    assert_eq!(probes.load(Ordering::SeqCst), 0);
    let stats = scanner.statistics();
    assert_eq!(stats.total_targets, 1);
    assert_eq!(stats.dns_failed, 1);
    assert_eq!(stats.successful_ips, 0);
}

#[test]
fn resolved_domains_are_probed_by_ip() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "mail.example\nother.example\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::with(&[("mail.example", "192.0.2.10")]),
        vec![protocol],
    );
    scanner.start(&targets);
    let mut reports = scanner.get_results();
    reports.sort_by(|a, b| a.target.domain.cmp(&b.target.domain));

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].target.domain, "mail.example");
    assert_eq!(reports[0].target.ip, "192.0.2.10");
    assert_eq!(reports[0].protocols.len(), 1);
    // The probe keeps the domain as its host identity.
    assert_eq!(reports[0].protocols[0].host, "mail.example");
    assert!(reports[1].protocols.is_empty());
}

#[test]
fn single_session_cap_still_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.1.0.0,10.1.0.7\n");
    let (protocol, probes) = StubProtocol::accessible("SMTP", &[25]);

    let mut config = test_config(dir.path());
    config.max_work_count = 1;
    config.batch_size = 1;

    let scanner =
        Scanner::with_components(config, ScriptedResolver::empty(), vec![protocol]);
    scanner.start(&targets);
    let reports = scanner.get_results();

    assert_eq!(reports.len(), 8);
    assert_eq!(probes.load(Ordering::SeqCst), 8);
}

#[test]
fn tiny_staging_buffer_scans_everything() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.2.0.0/28\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);

    let mut config = test_config(dir.path());
    config.targets_max_size = 1;

    let scanner =
        Scanner::with_components(config, ScriptedResolver::empty(), vec![protocol]);
    scanner.start(&targets);
    let reports = scanner.get_results();

    assert_eq!(reports.len(), 16);
}

#[test]
fn protocol_without_ports_contributes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.3.0.1\n");
    let (empty_protocol, probes) = StubProtocol::accessible("SMTP", &[]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![empty_protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].protocols.is_empty());
    assert_eq!(probes.load(Ordering::SeqCst), 0);
}

#[test]
fn streaming_mode_writes_results_file() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.4.0.1\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);

    let mut config = test_config(dir.path());
    config.output_write_mode = WriteMode::Stream;

    let scanner =
        Scanner::with_components(config, ScriptedResolver::empty(), vec![protocol]);
    scanner.start(&targets);
    let reports = scanner.get_results();

    // Streaming mode hands nothing back; it all went to disk.
    assert!(reports.is_empty());
    let written = std::fs::read_to_string(dir.path().join("scan_results.txt")).unwrap();
    assert!(written.starts_with("Scan Results\n============\n"));
    assert!(written.contains("10.4.0.1 (10.4.0.1)"));
    assert!(written.contains("[SMTP] 10.4.0.1:25 -> OK"));
    assert!(written.contains("banner: 220 10.4.0.1 ready"));
    // Clean completion removes the checkpoint.
    assert!(!dir.path().join("targets.txt.progress.json").exists());
}

#[test]
fn statistics_balance_across_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "ok.example\ndead.example\n10.5.0.1\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::with(&[("ok.example", "192.0.2.20")]),
        vec![protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();
    assert_eq!(reports.len(), 3);

    let stats = scanner.statistics();
    assert_eq!(stats.total_targets, 3);
    assert_eq!(stats.successful_ips, 2);
    assert_eq!(stats.dns_failed, 1);
    // total == successful + unsuccessful + dns_failed
    let unsuccessful = stats.total_targets - stats.successful_ips - stats.dns_failed;
    assert_eq!(unsuccessful, 0);
    assert_eq!(stats.protocol_counts.get("SMTP"), Some(&2));
}

#[test]
fn checkpoint_resume_skips_already_processed_ips() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.0.0.0/30\n");

    // A previous run got as far as 10.0.0.1.
    let store = ProgressStore::new(&targets, dir.path());
    store.save(&CheckpointInfo {
        last_ip: "10.0.0.1".into(),
        processed_count: 2,
        successful_count: 1,
        timestamp: utc_timestamp(),
        input_file_hash: store.input_hash().to_owned(),
    });

    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);
    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![protocol],
    );
    scanner.start(&targets);
    let mut reports = scanner.get_results();
    reports.sort_by(|a, b| a.target.ip.cmp(&b.target.ip));

    let ips: Vec<_> = reports.iter().map(|r| r.target.ip.as_str()).collect();
    assert_eq!(ips, ["10.0.0.2", "10.0.0.3"]);
    // Totals fold in the checkpointed progress.
    assert_eq!(scanner.statistics().total_targets, 4);
}

#[test]
fn checkpoint_for_a_different_input_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.0.0.0/30\n");

    let store = ProgressStore::new(&targets, dir.path());
    store.save(&CheckpointInfo {
        last_ip: "10.0.0.1".into(),
        processed_count: 2,
        successful_count: 1,
        timestamp: utc_timestamp(),
        input_file_hash: "some-other-file".into(),
    });

    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);
    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();
    assert_eq!(reports.len(), 4);
}

#[test]
fn required_format_sequences_survive_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.6.0.1\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25, 587]);

    let scanner = Scanner::with_components(
        test_config(dir.path()),
        ScriptedResolver::empty(),
        vec![protocol],
    );
    scanner.start(&targets);
    let reports = scanner.get_results();

    let mut handler = ResultHandler::new(OutputFormat::Required);
    let rendered = handler.reports_to_string(&reports);
    let lines: Vec<_> = rendered.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("1,10.6.0.1,"));
    assert!(lines[1].starts_with("1,10.6.0.1,"));
}

#[test]
fn stop_terminates_early_without_hanging() {
    let dir = tempfile::tempdir().unwrap();
    let targets = write_targets(dir.path(), "10.7.0.0/16\n");
    let (protocol, _) = StubProtocol::accessible("SMTP", &[25]);

    let mut config = test_config(dir.path());
    config.targets_max_size = 4;
    config.max_work_count = 2;
    config.batch_size = 2;

    let scanner = Arc::new(Scanner::with_components(
        config,
        ScriptedResolver::empty(),
        vec![protocol],
    ));
    scanner.start(&targets);
    std::thread::sleep(Duration::from_millis(50));
    scanner.stop();
    let reports = scanner.get_results();

    // A 65k-target scan interrupted after 50ms cannot have finished.
    assert!((reports.len() as u64) < 65_536);
}
