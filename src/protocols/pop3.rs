//! POP3 greeting probe.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use super::{chomp, probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

pub struct Pop3Protocol;

#[async_trait]
impl Protocol for Pop3Protocol {
    fn name(&self) -> &'static str {
        "POP3"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[110, 995]
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: std::time::Duration) -> ProtocolResult {
        probe_with(self.name(), host.to_owned(), ip, port, timeout, exchange).await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        for line in response.lines() {
            if line.starts_with("+OK") && attrs.banner.is_empty() {
                attrs.banner = line.to_owned();
                continue;
            }
            if line.contains("USER") {
                attrs.pop3.user = true;
            }
            if line.contains("TOP") {
                attrs.pop3.top = true;
            }
            if line.contains("PIPELINING") {
                attrs.pop3.pipelining = true;
            }
            if line.contains("UIDL") {
                attrs.pop3.uidl = true;
            }
            if line.contains("STLS") {
                attrs.pop3.stls = true;
            }
            if line.contains("SASL") {
                attrs.pop3.sasl = true;
            }
        }
    }
}

async fn exchange(stream: TcpStream) -> Result<ProtocolAttributes, String> {
    let mut attrs = ProtocolAttributes::default();
    let mut reader = BufReader::new(stream);

    let mut greeting = String::new();
    reader
        .read_line(&mut greeting)
        .await
        .map_err(|err| format!("Read greeting failed: {err}"))?;
    chomp(&mut greeting);

    if greeting.starts_with("+OK") || greeting.contains("OK") {
        attrs.banner = greeting;
        Ok(attrs)
    } else {
        Err(format!("Invalid POP3 greeting: {greeting}"))
    }
}
