//! SSH version-exchange probe.
//!
//! An SSH server sends its identification string immediately after the TCP
//! handshake; reading one line is the entire exchange.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use super::{chomp, probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

pub struct SshProtocol;

#[async_trait]
impl Protocol for SshProtocol {
    fn name(&self) -> &'static str {
        "SSH"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[22]
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: std::time::Duration) -> ProtocolResult {
        probe_with(self.name(), host.to_owned(), ip, port, timeout, exchange).await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        if let Some(line) = response.lines().find(|line| line.starts_with("SSH-")) {
            attrs.banner = line.trim_end().to_owned();
        }
    }
}

async fn exchange(stream: TcpStream) -> Result<ProtocolAttributes, String> {
    let mut attrs = ProtocolAttributes::default();
    let mut reader = BufReader::new(stream);

    let mut version = String::new();
    reader
        .read_line(&mut version)
        .await
        .map_err(|err| format!("Read SSH version failed: {err}"))?;
    chomp(&mut version);
    attrs.banner = version;
    Ok(attrs)
}
