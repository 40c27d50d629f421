//! Telnet probe: captures whatever the server volunteers on connect.
//!
//! Telnet servers commonly lead with IAC option negotiation rather than
//! text, so the probe reads one chunk, strips negotiation bytes, and keeps
//! the printable remainder as the banner. A connection that stays silent
//! still counts as accessible once bytes or EOF arrive inside the deadline.

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::{probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

const IAC: u8 = 255;

pub struct TelnetProtocol;

#[async_trait]
impl Protocol for TelnetProtocol {
    fn name(&self) -> &'static str {
        "TELNET"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[23]
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: std::time::Duration) -> ProtocolResult {
        probe_with(self.name(), host.to_owned(), ip, port, timeout, exchange).await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        let trimmed = response.trim();
        if !trimmed.is_empty() {
            attrs.banner = trimmed.lines().next().unwrap_or_default().to_owned();
        }
    }
}

async fn exchange(mut stream: TcpStream) -> Result<ProtocolAttributes, String> {
    let mut attrs = ProtocolAttributes::default();
    let mut chunk = [0u8; 512];
    let read = stream
        .read(&mut chunk)
        .await
        .map_err(|err| format!("Read greeting failed: {err}"))?;
    attrs.banner = printable_banner(&chunk[..read]);
    Ok(attrs)
}

/// Drops IAC negotiation triplets and control bytes, keeping the first text
/// line the server sent.
fn printable_banner(bytes: &[u8]) -> String {
    let mut text = String::new();
    let mut iter = bytes.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if byte == IAC {
            // IAC <command> <option>
            iter.next();
            iter.next();
            continue;
        }
        if byte == b'\r' || byte == b'\n' {
            if !text.is_empty() {
                break;
            }
            continue;
        }
        if byte.is_ascii_graphic() || byte == b' ' {
            text.push(byte as char);
        }
    }
    text.trim().to_owned()
}
