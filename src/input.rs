//! Command-line options, the TOML configuration file, and the resolved
//! runtime configuration.
//!
//! Settings resolve in three layers: built-in defaults, then the config
//! file, then command-line flags. The config file is TOML with `[scanner]`,
//! `[protocols.<NAME>]`, `[output]`, `[vendor]` and `[dns]` tables; a file
//! that fails to parse is logged and ignored so a bad edit never blocks a
//! run.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::warn;
use serde_derive::Deserialize;

use crate::output::OutputFormat;

/// Canonical protocol ordering; everything downstream (port queues, result
/// bins) inherits this order.
pub const PROTOCOL_ORDER: [&str; 7] = ["SMTP", "POP3", "IMAP", "HTTP", "FTP", "TELNET", "SSH"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The result thread appends to `scan_results.txt` as reports arrive.
    Stream,
    /// Reports accumulate in memory and are written once at the end.
    Final,
}

impl WriteMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "stream" => Some(Self::Stream),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

/// Multi-protocol banner scanner for mail and shell services.
/// WARNING Do not aim this at infrastructure you do not own; a single run
/// can open tens of thousands of sockets.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "bannerscan", version, max_term_width = 120)]
pub struct Opts {
    /// Input file of targets (domains, IPs, CIDR blocks, ranges) or a
    /// directory of such files.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Custom path to the TOML config file.
    #[arg(short, long)]
    pub config_path: Option<PathBuf>,

    /// Ignore the configuration file entirely.
    #[arg(long)]
    pub no_config: bool,

    /// Output directory for results and checkpoints.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format: text, csv, json, report or required_format.
    #[arg(short, long)]
    pub format: Option<String>,

    /// Comma-separated protocols to enable (SMTP,POP3,IMAP,HTTP,FTP,TELNET,SSH).
    #[arg(short, long, value_delimiter = ',')]
    pub protocols: Option<Vec<String>>,

    /// Reactor pool size (network I/O event loops).
    #[arg(long)]
    pub io_threads: Option<usize>,

    /// Worker pool size (probe submission and parsing).
    #[arg(long)]
    pub cpu_threads: Option<usize>,

    /// Maximum new probe submissions per scheduler tick.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Per-probe timeout in milliseconds; 0 enables adaptive timeouts.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Hard cap on concurrently alive sessions; 0 derives it from the FD limit.
    #[arg(long)]
    pub max_work_count: Option<usize>,

    /// Skip this many targets at the front of the input stream.
    #[arg(long)]
    pub offset: Option<usize>,

    /// Keep only successful probe results.
    #[arg(long)]
    pub only_success: bool,

    /// Probe every available port for every enabled protocol.
    #[arg(long)]
    pub scan_all_ports: bool,

    /// Enable verbose (debug) logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub io_thread_count: usize,
    pub cpu_thread_count: usize,
    pub batch_size: usize,
    pub targets_max_size: usize,
    pub dns_timeout: Duration,
    pub probe_timeout: Duration,
    pub retry_count: u32,
    pub only_success: bool,
    pub max_work_count: usize,
    pub result_flush_interval: Duration,
    pub output_write_mode: WriteMode,
    pub checkpoint_interval: usize,
    pub scan_all_ports: bool,
    pub offset: usize,
    pub enabled_protocols: Vec<String>,
    pub output_dir: PathBuf,
    pub output_formats: Vec<OutputFormat>,
    pub output_to_console: bool,
    pub vendor_enabled: bool,
    pub vendor_pattern_file: Option<PathBuf>,
    pub vendor_similarity_threshold: f64,
    pub dns_max_mx_records: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            io_thread_count: 4,
            cpu_thread_count: 2,
            batch_size: 10_000,
            targets_max_size: 10_000,
            dns_timeout: Duration::from_millis(5_000),
            probe_timeout: Duration::from_millis(60_000),
            retry_count: 1,
            only_success: false,
            max_work_count: 0,
            result_flush_interval: Duration::from_millis(5_000),
            output_write_mode: WriteMode::Stream,
            checkpoint_interval: 1_000,
            scan_all_ports: false,
            offset: 0,
            enabled_protocols: vec!["SMTP".into(), "POP3".into(), "IMAP".into()],
            output_dir: PathBuf::from("./result"),
            output_formats: vec![OutputFormat::Text],
            output_to_console: false,
            vendor_enabled: false,
            vendor_pattern_file: None,
            vendor_similarity_threshold: 0.8,
            dns_max_mx_records: 10,
        }
    }
}

impl ScannerConfig {
    /// Defaults, then the config file, then CLI flags.
    pub fn resolve(opts: &Opts) -> Self {
        let mut config = Self::default();
        if !opts.no_config {
            let path = opts
                .config_path
                .clone()
                .unwrap_or_else(default_config_path);
            config.apply_file(&ConfigFile::read(&path));
        }
        config.apply_opts(opts);
        config
    }

    fn apply_file(&mut self, file: &ConfigFile) {
        macro_rules! merge {
            ($section:expr, $($field:ident => $target:expr),+ $(,)?) => {
                $(
                    if let Some(value) = $section.$field.clone() {
                        $target = value.into();
                    }
                )+
            }
        }

        let s = &file.scanner;
        merge!(s,
            io_thread_count => self.io_thread_count,
            cpu_thread_count => self.cpu_thread_count,
            batch_size => self.batch_size,
            targets_max_size => self.targets_max_size,
            retry_count => self.retry_count,
            only_success => self.only_success,
            max_work_count => self.max_work_count,
            checkpoint_interval => self.checkpoint_interval,
            scan_all_ports => self.scan_all_ports,
            offset => self.offset,
        );
        if let Some(ms) = s.dns_timeout_ms {
            self.dns_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = s.probe_timeout_ms {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = s.result_flush_interval_ms {
            self.result_flush_interval = Duration::from_millis(ms);
        }
        if let Some(mode) = &s.output_write_mode {
            match WriteMode::parse(mode) {
                Some(mode) => self.output_write_mode = mode,
                None => warn!("invalid write_mode {mode:?}, keeping {:?}", self.output_write_mode),
            }
        }

        if !file.protocols.is_empty() {
            let previously_enabled = self.enabled_protocols.clone();
            self.enabled_protocols = PROTOCOL_ORDER
                .iter()
                .filter(|name| {
                    file.protocols
                        .get(**name)
                        .and_then(|p| p.enabled)
                        .unwrap_or_else(|| previously_enabled.iter().any(|e| e == *name))
                })
                .map(|name| (*name).to_owned())
                .collect();
        }

        let o = &file.output;
        if let Some(dir) = &o.directory {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(mode) = &o.write_mode {
            match WriteMode::parse(mode) {
                Some(mode) => self.output_write_mode = mode,
                None => warn!("invalid write_mode {mode:?}, fallback to stream"),
            }
        }
        if let Some(formats) = &o.formats {
            let parsed: Vec<_> = formats
                .iter()
                .filter_map(|name| {
                    let format = OutputFormat::parse(name);
                    if format.is_none() {
                        warn!("unknown output format {name:?} ignored");
                    }
                    format
                })
                .collect();
            if !parsed.is_empty() {
                self.output_formats = parsed;
            }
        } else if let Some(format) = &o.format {
            if let Some(format) = OutputFormat::parse(format) {
                self.output_formats = vec![format];
            } else {
                warn!("unknown output format {format:?} ignored");
            }
        }
        if let Some(to_console) = o.to_console {
            self.output_to_console = to_console;
        }

        let v = &file.vendor;
        if let Some(enabled) = v.enabled {
            self.vendor_enabled = enabled;
        }
        if let Some(path) = &v.pattern_file {
            self.vendor_pattern_file = Some(PathBuf::from(path));
        }
        if let Some(threshold) = v.similarity_threshold {
            self.vendor_similarity_threshold = threshold;
        }

        if let Some(max) = file.dns.max_mx_records {
            self.dns_max_mx_records = max;
        }
    }

    fn apply_opts(&mut self, opts: &Opts) {
        macro_rules! merge_opt {
            ($($field:ident => $target:expr),+ $(,)?) => {
                $(
                    if let Some(value) = opts.$field.clone() {
                        $target = value.into();
                    }
                )+
            }
        }

        merge_opt!(
            io_threads => self.io_thread_count,
            cpu_threads => self.cpu_thread_count,
            batch_size => self.batch_size,
            max_work_count => self.max_work_count,
            offset => self.offset,
            output => self.output_dir,
        );
        if let Some(ms) = opts.timeout {
            self.probe_timeout = Duration::from_millis(ms);
        }
        if opts.only_success {
            self.only_success = true;
        }
        if opts.scan_all_ports {
            self.scan_all_ports = true;
        }
        if let Some(format) = &opts.format {
            match OutputFormat::parse(format) {
                Some(format) => self.output_formats = vec![format],
                None => warn!("unknown output format {format:?} ignored"),
            }
        }
        if let Some(protocols) = &opts.protocols {
            self.enabled_protocols = PROTOCOL_ORDER
                .iter()
                .filter(|name| protocols.iter().any(|p| p.eq_ignore_ascii_case(name)))
                .copied()
                .map(|name| (*name).to_owned())
                .collect();
        }
    }
}

/// Raw TOML config file; every field optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub scanner: ScannerSection,
    pub protocols: HashMap<String, ProtocolSection>,
    pub output: OutputSection,
    pub vendor: VendorSection,
    pub dns: DnsSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ScannerSection {
    pub io_thread_count: Option<usize>,
    pub cpu_thread_count: Option<usize>,
    pub batch_size: Option<usize>,
    pub targets_max_size: Option<usize>,
    pub dns_timeout_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub only_success: Option<bool>,
    pub max_work_count: Option<usize>,
    pub result_flush_interval_ms: Option<u64>,
    pub output_write_mode: Option<String>,
    pub checkpoint_interval: Option<usize>,
    pub scan_all_ports: Option<bool>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProtocolSection {
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OutputSection {
    pub directory: Option<String>,
    pub format: Option<String>,
    pub formats: Option<Vec<String>>,
    pub write_mode: Option<String>,
    pub to_console: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct VendorSection {
    pub enabled: Option<bool>,
    pub pattern_file: Option<String>,
    pub similarity_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DnsSection {
    pub max_mx_records: Option<usize>,
}

impl ConfigFile {
    /// Reads and parses the config file. A missing or unparseable file
    /// yields the empty config so defaults apply.
    pub fn read(path: &std::path::Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                warn!("config file {} not found, using defaults", path.display());
                return Self::default();
            }
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!("failed to parse {}: {err}; using defaults", path.display());
                Self::default()
            }
        }
    }
}

/// Default config location: `~/.bannerscan.toml`.
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".bannerscan.toml");
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write as _;

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn defaults_enable_the_mail_protocols() {
        let config = ScannerConfig::default();
        assert_eq!(config.enabled_protocols, ["SMTP", "POP3", "IMAP"]);
        assert_eq!(config.output_write_mode, WriteMode::Stream);
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.max_work_count, 0);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[scanner]
io_thread_count = 8
batch_size = 500
probe_timeout_ms = 0
targets_max_size = 64
output_write_mode = "final"

[protocols.HTTP]
enabled = true

[protocols.POP3]
enabled = false

[output]
directory = "/tmp/scan-out"
format = "json"
to_console = true

[vendor]
enabled = true
pattern_file = "/tmp/vendors.json"
"#
        )
        .unwrap();

        let mut config = ScannerConfig::default();
        config.apply_file(&ConfigFile::read(file.path()));

        assert_eq!(config.io_thread_count, 8);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.probe_timeout, Duration::ZERO);
        assert_eq!(config.targets_max_size, 64);
        assert_eq!(config.output_write_mode, WriteMode::Final);
        assert_eq!(config.enabled_protocols, ["SMTP", "IMAP", "HTTP"]);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/scan-out"));
        assert_eq!(config.output_formats, vec![OutputFormat::Json]);
        assert!(config.output_to_console);
        assert!(config.vendor_enabled);
        assert_eq!(
            config.vendor_pattern_file,
            Some(PathBuf::from("/tmp/vendors.json"))
        );
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[scanner\nbatch_size = ").unwrap();
        let mut config = ScannerConfig::default();
        config.apply_file(&ConfigFile::read(file.path()));
        assert_eq!(config.batch_size, ScannerConfig::default().batch_size);
    }

    #[test]
    fn cli_flags_override_config_file() {
        let opts = Opts {
            io_threads: Some(16),
            timeout: Some(250),
            protocols: Some(vec!["ssh".into(), "smtp".into()]),
            only_success: true,
            scan_all_ports: true,
            no_config: true,
            ..Opts::default()
        };
        let config = ScannerConfig::resolve(&opts);
        assert_eq!(config.io_thread_count, 16);
        assert_eq!(config.probe_timeout, Duration::from_millis(250));
        // Canonical declaration order wins over the flag order.
        assert_eq!(config.enabled_protocols, ["SMTP", "SSH"]);
        assert!(config.only_success);
        assert!(config.scan_all_ports);
    }

    #[test]
    fn unknown_cli_format_keeps_previous_formats() {
        let opts = Opts {
            format: Some("yaml".into()),
            no_config: true,
            ..Opts::default()
        };
        let config = ScannerConfig::resolve(&opts);
        assert_eq!(config.output_formats, vec![OutputFormat::Text]);
    }

    #[test]
    fn write_mode_parsing() {
        assert_eq!(WriteMode::parse("stream"), Some(WriteMode::Stream));
        assert_eq!(WriteMode::parse("FINAL"), Some(WriteMode::Final));
        assert_eq!(WriteMode::parse("both"), None);
    }
}
