//! FTP greeting probe.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use super::{chomp, probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

pub struct FtpProtocol;

#[async_trait]
impl Protocol for FtpProtocol {
    fn name(&self) -> &'static str {
        "FTP"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[21, 990]
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: std::time::Duration) -> ProtocolResult {
        probe_with(self.name(), host.to_owned(), ip, port, timeout, exchange).await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        if let Some(line) = response.lines().find(|line| line.starts_with("220")) {
            attrs.banner = line.to_owned();
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

    if greeting.starts_with("220") {
        attrs.banner = greeting;
        Ok(attrs)
    } else {
        Err(format!("Invalid FTP greeting: {greeting}"))
    }
}
