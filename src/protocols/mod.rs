//! Protocol probes: one short banner/capability exchange per TCP connection.
//!
//! Every protocol implements [`Protocol`]: it declares its default ports,
//! runs an async probe against one `(ip, port)` with a hard deadline, and
//! can re-parse a captured response into [`ProtocolAttributes`]. A probe
//! holds exactly one socket for its lifetime and completes exactly once —
//! either with the exchange outcome or with a timeout error once the
//! deadline fires, which also tears the connection down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

pub mod ftp;
pub mod http;
pub mod imap;
pub mod pop3;
pub mod smtp;
pub mod ssh;
pub mod telnet;

pub type Port = u16;

/// ESMTP feature set announced in the EHLO response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmtpAttributes {
    pub pipelining: bool,
    pub starttls: bool,
    pub size_supported: bool,
    pub size_limit: u64,
    pub utf8: bool,
    pub eightbitmime: bool,
    pub dsn: bool,
    pub auth_methods: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pop3Attributes {
    pub stls: bool,
    pub sasl: bool,
    pub user: bool,
    pub top: bool,
    pub pipelining: bool,
    pub uidl: bool,
    pub capabilities: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImapAttributes {
    pub starttls: bool,
    pub quota: bool,
    pub acl: bool,
    pub imap4rev1: bool,
    pub auth_plain: bool,
    pub auth_login: bool,
    pub idle: bool,
    pub unselect: bool,
    pub uidplus: bool,
    pub capabilities: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpAttributes {
    pub server: String,
    pub content_type: String,
    pub status_code: u16,
}

/// Everything a probe learned about one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolAttributes {
    pub smtp: SmtpAttributes,
    pub pop3: Pop3Attributes,
    pub imap: ImapAttributes,
    pub http: HttpAttributes,
    /// Service welcome line, verbatim.
    pub banner: String,
    /// Vendor label filled in after the scan by the pattern detector.
    pub vendor: String,
    pub response_time_ms: f64,
}

/// Outcome of exactly one `(protocol, ip, port)` probe.
#[derive(Debug, Clone, Default)]
pub struct ProtocolResult {
    pub protocol: String,
    pub host: String,
    pub port: Port,
    pub accessible: bool,
    pub attrs: ProtocolAttributes,
    pub error: String,
}

#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_ports(&self) -> &'static [Port];

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(3000)
    }

    /// Connects to `ip:port` and runs the protocol's exchange within
    /// `timeout`. `host` carries the original domain when one exists, for
    /// protocols that send it on the wire.
    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: Duration) -> ProtocolResult;

    /// Re-parses a captured response transcript into attributes.
    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes);
}

/// Builds the enabled protocol set in declaration order. This order also
/// fixes the port-queue scheduling order inside a session.
pub fn enabled_protocols(names: &[&str]) -> Vec<Arc<dyn Protocol>> {
    let mut protocols: Vec<Arc<dyn Protocol>> = Vec::new();
    for name in names {
        match name.to_ascii_uppercase().as_str() {
            "SMTP" => protocols.push(Arc::new(smtp::SmtpProtocol)),
            "POP3" => protocols.push(Arc::new(pop3::Pop3Protocol)),
            "IMAP" => protocols.push(Arc::new(imap::ImapProtocol)),
            "HTTP" => protocols.push(Arc::new(http::HttpProtocol)),
            "FTP" => protocols.push(Arc::new(ftp::FtpProtocol)),
            "TELNET" => protocols.push(Arc::new(telnet::TelnetProtocol)),
            "SSH" => protocols.push(Arc::new(ssh::SshProtocol)),
            other => log::warn!("unknown protocol {other:?} ignored"),
        }
    }
    protocols
}

/// Shared probe scaffold: dial, run the exchange under one deadline, stamp
/// the elapsed time. Dropping the in-flight future on timeout closes the
/// socket and cancels pending I/O, so completion is single-shot by
/// construction.
pub(crate) async fn probe_with<F, Fut>(
    name: &'static str,
    host: String,
    ip: &str,
    port: Port,
    deadline: Duration,
    exchange: F,
) -> ProtocolResult
where
    F: FnOnce(TcpStream) -> Fut,
    Fut: std::future::Future<Output = Result<ProtocolAttributes, String>>,
{
    let mut result = ProtocolResult {
        protocol: name.to_owned(),
        host,
        port,
        ..ProtocolResult::default()
    };

    let addr: SocketAddr = match format!("{ip}:{port}").parse() {
        Ok(addr) => addr,
        Err(_) => {
            result.error = format!("Invalid address: {ip}");
            return result;
        }
    };

    let attempt = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| format!("Connect failed: {err}"))?;
        let started = Instant::now();
        let attrs = exchange(stream).await?;
        Ok::<_, String>((attrs, started.elapsed()))
    };

    match tokio::time::timeout(deadline, attempt).await {
        Ok(Ok((mut attrs, elapsed))) => {
            attrs.response_time_ms = elapsed.as_secs_f64() * 1000.0;
            result.attrs = attrs;
            result.accessible = true;
        }
        Ok(Err(message)) => result.error = message,
        Err(_) => result.error = format!("{name} probe timed out"),
    }
    result
}

/// Strips a trailing CRLF or LF in place.
pub(crate) fn chomp(line: &mut String) {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
}
