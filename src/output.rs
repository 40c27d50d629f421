//! Report formatters: text, CSV, JSON, report and the fixed
//! `seq,ip,port,banner` export format.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde_json::json;

use crate::protocols::{ProtocolAttributes, ProtocolResult};
use crate::session::ScanReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Csv,
    Json,
    Report,
    Required,
}

impl OutputFormat {
    /// Parses a config/CLI format name; `txt` is accepted as `text`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "text" | "txt" => Some(Self::Text),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "report" => Some(Self::Report),
            "required_format" | "required" => Some(Self::Required),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            _ => "txt",
        }
    }
}

/// Stateful formatter for a batch of reports.
///
/// The required format numbers unique IPs in first-seen order; that counter
/// lives on the handler so one handler formats one run.
pub struct ResultHandler {
    format: OutputFormat,
    only_success: bool,
    ip_seq: usize,
    ip_to_seq: HashMap<String, usize>,
}

impl ResultHandler {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            only_success: false,
            ip_seq: 0,
            ip_to_seq: HashMap::new(),
        }
    }

    pub fn set_only_success(&mut self, only_success: bool) {
        self.only_success = only_success;
    }

    pub fn report_to_string(&mut self, report: &ScanReport) -> String {
        match self.format {
            OutputFormat::Json => self.to_json_value(report).to_string(),
            OutputFormat::Csv => format!("{}{}", csv_header(), self.to_csv_rows(report)),
            OutputFormat::Required => self.to_required(report),
            OutputFormat::Text | OutputFormat::Report => self.to_text(report),
        }
    }

    pub fn reports_to_string(&mut self, reports: &[ScanReport]) -> String {
        match self.format {
            OutputFormat::Json => {
                let values: Vec<_> = reports.iter().map(|r| self.to_json_value(r)).collect();
                serde_json::to_string_pretty(&values).unwrap_or_else(|_| "[]".to_owned())
            }
            OutputFormat::Csv => {
                let mut out = csv_header();
                for report in reports {
                    out.push_str(&self.to_csv_rows(report));
                }
                out
            }
            OutputFormat::Required => reports.iter().map(|r| self.to_required(r)).collect(),
            OutputFormat::Text | OutputFormat::Report => {
                let mut out = String::new();
                for report in reports {
                    out.push_str(&self.to_text(report));
                    out.push('\n');
                }
                out
            }
        }
    }

    fn filtered<'a>(&self, report: &'a ScanReport) -> Vec<&'a ProtocolResult> {
        report
            .protocols
            .iter()
            .filter(|pr| !self.only_success || pr.accessible)
            .collect()
    }

    /// Human-readable block per target.
    pub fn to_text(&self, report: &ScanReport) -> String {
        let protocols = self.filtered(report);
        let mut out = String::new();
        if !protocols.is_empty() {
            let _ = writeln!(out, "{} ({})", report.target.domain, report.target.ip);
        }
        for pr in protocols {
            let _ = write!(
                out,
                "  [{}] {}:{} -> {}",
                pr.protocol,
                pr.host,
                pr.port,
                if pr.accessible { "OK" } else { "FAIL" }
            );
            if !pr.error.is_empty() {
                let _ = write!(out, " ({})", pr.error);
            }
            out.push('\n');
            if pr.accessible {
                if !pr.attrs.banner.is_empty() {
                    let _ = writeln!(out, "    banner: {}", pr.attrs.banner);
                }
                if !pr.attrs.vendor.is_empty() {
                    let _ = writeln!(out, "    vendor: {}", pr.attrs.vendor);
                }
                if pr.protocol == "SMTP" {
                    let size = if pr.attrs.smtp.size_supported {
                        pr.attrs.smtp.size_limit.to_string()
                    } else {
                        "unsupported".to_owned()
                    };
                    let auth = if pr.attrs.smtp.auth_methods.is_empty() {
                        "-"
                    } else {
                        pr.attrs.smtp.auth_methods.as_str()
                    };
                    let _ = writeln!(
                        out,
                        "    features: PIPELINING={}, STARTTLS={}, 8BITMIME={}, DSN={}, SMTPUTF8={}, SIZE={}, AUTH={}",
                        bool_flag(pr.attrs.smtp.pipelining),
                        bool_flag(pr.attrs.smtp.starttls),
                        bool_flag(pr.attrs.smtp.eightbitmime),
                        bool_flag(pr.attrs.smtp.dsn),
                        bool_flag(pr.attrs.smtp.utf8),
                        size,
                        auth,
                    );
                }
            }
        }
        out
    }

    /// `<seq>,<ip>,<port>,<banner>` with sequence numbers assigned to unique
    /// IPs in first-seen order across the handler's lifetime.
    fn to_required(&mut self, report: &ScanReport) -> String {
        let mut out = String::new();
        for pr in report
            .protocols
            .iter()
            .filter(|pr| !self.only_success || pr.accessible)
        {
            let seq = match self.ip_to_seq.get(&report.target.ip) {
                Some(seq) => *seq,
                None => {
                    self.ip_seq += 1;
                    self.ip_to_seq
                        .insert(report.target.ip.clone(), self.ip_seq);
                    self.ip_seq
                }
            };
            let _ = writeln!(
                out,
                "{seq},{},{},{}",
                report.target.ip, pr.port, pr.attrs.banner
            );
        }
        out
    }

    fn to_csv_rows(&self, report: &ScanReport) -> String {
        let mut out = String::new();
        for pr in self.filtered(report) {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{:.2},{}",
                csv_escape(&report.target.domain),
                csv_escape(&report.target.ip),
                csv_escape(&pr.protocol),
                csv_escape(&pr.host),
                pr.port,
                u8::from(pr.accessible),
                csv_escape(&pr.error),
                csv_escape(&pr.attrs.vendor),
                csv_escape(&pr.attrs.banner),
                pr.attrs.response_time_ms,
                csv_escape(&format_attributes(&pr.attrs)),
            );
        }
        out
    }

    fn to_json_value(&self, report: &ScanReport) -> serde_json::Value {
        let protocols: Vec<_> = self
            .filtered(report)
            .into_iter()
            .map(|pr| {
                let mut value = json!({
                    "protocol": pr.protocol,
                    "host": pr.host,
                    "port": pr.port,
                    "accessible": pr.accessible,
                    "error": pr.error,
                    "banner": pr.attrs.banner,
                    "vendor": pr.attrs.vendor,
                    "response_time_ms": pr.attrs.response_time_ms,
                });
                match pr.protocol.as_str() {
                    "SMTP" => {
                        value["smtp"] = json!({
                            "pipelining": pr.attrs.smtp.pipelining,
                            "starttls": pr.attrs.smtp.starttls,
                            "size_supported": pr.attrs.smtp.size_supported,
                            "size_limit": pr.attrs.smtp.size_limit,
                            "utf8": pr.attrs.smtp.utf8,
                            "8bitmime": pr.attrs.smtp.eightbitmime,
                            "dsn": pr.attrs.smtp.dsn,
                            "auth_methods": pr.attrs.smtp.auth_methods,
                        });
                    }
                    "POP3" => {
                        value["pop3"] = json!({
                            "stls": pr.attrs.pop3.stls,
                            "sasl": pr.attrs.pop3.sasl,
                            "user": pr.attrs.pop3.user,
                            "top": pr.attrs.pop3.top,
                            "pipelining": pr.attrs.pop3.pipelining,
                            "uidl": pr.attrs.pop3.uidl,
                            "capabilities": pr.attrs.pop3.capabilities,
                        });
                    }
                    "IMAP" => {
                        value["imap"] = json!({
                            "starttls": pr.attrs.imap.starttls,
                            "quota": pr.attrs.imap.quota,
                            "acl": pr.attrs.imap.acl,
                            "imap4rev1": pr.attrs.imap.imap4rev1,
                            "auth_plain": pr.attrs.imap.auth_plain,
                            "auth_login": pr.attrs.imap.auth_login,
                            "idle": pr.attrs.imap.idle,
                            "unselect": pr.attrs.imap.unselect,
                            "uidplus": pr.attrs.imap.uidplus,
                            "capabilities": pr.attrs.imap.capabilities,
                        });
                    }
                    "HTTP" => {
                        value["http"] = json!({
                            "server": pr.attrs.http.server,
                            "content_type": pr.attrs.http.content_type,
                            "status_code": pr.attrs.http.status_code,
                        });
                    }
                    _ => {}
                }
                value
            })
            .collect();

        json!({
            "domain": report.target.domain,
            "ip": report.target.ip,
            "total_time_ms": report.total_time.as_millis() as u64,
            "protocols": protocols,
        })
    }
}

fn bool_flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn csv_header() -> String {
    "domain,ip,protocol,host,port,accessible,error,vendor,banner,response_time_ms,details\n"
        .to_owned()
}

fn csv_escape(field: &str) -> String {
    if !field.contains([',', '"', '\n']) {
        return field.to_owned();
    }
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Packs non-default attributes into a compact `key=value` summary.
fn format_attributes(attrs: &ProtocolAttributes) -> String {
    let mut out = String::new();
    if !attrs.banner.is_empty() {
        let _ = write!(out, "banner={};", attrs.banner);
    }
    if !attrs.vendor.is_empty() {
        let _ = write!(out, "vendor={};", attrs.vendor);
    }
    if attrs.smtp.pipelining || attrs.smtp.starttls || !attrs.smtp.auth_methods.is_empty() {
        let _ = write!(
            out,
            "smtp{{pipelining={},starttls={},size_supported={},size_limit={},utf8={},8bitmime={},dsn={},auth={}}};",
            bool_flag(attrs.smtp.pipelining),
            bool_flag(attrs.smtp.starttls),
            bool_flag(attrs.smtp.size_supported),
            attrs.smtp.size_limit,
            bool_flag(attrs.smtp.utf8),
            bool_flag(attrs.smtp.eightbitmime),
            bool_flag(attrs.smtp.dsn),
            attrs.smtp.auth_methods,
        );
    }
    if !attrs.pop3.capabilities.is_empty() {
        let _ = write!(out, "pop3{{{}}};", attrs.pop3.capabilities);
    }
    if !attrs.imap.capabilities.is_empty() {
        let _ = write!(out, "imap{{{}}};", attrs.imap.capabilities);
    }
    if !attrs.http.server.is_empty()
        || !attrs.http.content_type.is_empty()
        || attrs.http.status_code != 0
    {
        let _ = write!(
            out,
            "http{{server={},type={},code={}}};",
            attrs.http.server, attrs.http.content_type, attrs.http.status_code
        );
    }
    out
}
