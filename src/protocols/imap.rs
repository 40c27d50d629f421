//! IMAP greeting and CAPABILITY exchange.
//!
//! After the untagged `* OK`/`* PREAUTH` greeting the probe issues a tagged
//! `CAPABILITY` command and reads until the tagged completion line.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{chomp, probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

const TAG: &str = "A001";

pub struct ImapProtocol;

#[async_trait]
impl Protocol for ImapProtocol {
    fn name(&self) -> &'static str {
        "IMAP"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[143, 993]
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: std::time::Duration) -> ProtocolResult {
        probe_with(self.name(), host.to_owned(), ip, port, timeout, exchange).await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        for line in response.lines() {
            if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
                if attrs.banner.is_empty() {
                    attrs.banner = line.to_owned();
                }
                continue;
            }
            if line.starts_with("* CAPABILITY") {
                parse_capability_line(line, attrs);
            }
        }
    }
}

fn parse_capability_line(line: &str, attrs: &mut ProtocolAttributes) {
    attrs.imap.capabilities = line.trim_start_matches("* CAPABILITY").trim().to_owned();
    attrs.imap.imap4rev1 |= line.contains("IMAP4rev1");
    attrs.imap.starttls |= line.contains("STARTTLS");
    attrs.imap.auth_plain |= line.contains("AUTH=PLAIN");
    attrs.imap.auth_login |= line.contains("AUTH=LOGIN");
    attrs.imap.idle |= line.contains("IDLE");
    attrs.imap.unselect |= line.contains("UNSELECT");
    attrs.imap.uidplus |= line.contains("UIDPLUS");
    attrs.imap.quota |= line.contains("QUOTA");
    attrs.imap.acl |= line.contains("ACL");
}

async fn exchange(stream: TcpStream) -> Result<ProtocolAttributes, String> {
    let mut attrs = ProtocolAttributes::default();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut greeting = String::new();
    reader
        .read_line(&mut greeting)
        .await
        .map_err(|err| format!("Read greeting failed: {err}"))?;
    chomp(&mut greeting);
    if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
        return Err(format!("Invalid IMAP greeting: {greeting}"));
    }
    attrs.banner = greeting;

    write_half
        .write_all(format!("{TAG} CAPABILITY\r\n").as_bytes())
        .await
        .map_err(|err| format!("Write CAPABILITY failed: {err}"))?;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|err| format!("Read capability failed: {err}"))?;
        if read == 0 {
            return Err("CAPABILITY response truncated".to_owned());
        }
        chomp(&mut line);
        if line.starts_with("* CAPABILITY") {
            parse_capability_line(&line, &mut attrs);
            continue;
        }
        if line.starts_with(TAG) {
            if line.contains("OK") {
                return Ok(attrs);
            }
            return Err(format!("CAPABILITY failed: {line}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_line_sets_flags() {
        let mut attrs = ProtocolAttributes::default();
        ImapProtocol.parse_capabilities(
            "* OK [CAPABILITY IMAP4rev1] Dovecot ready.\n\
             * CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN AUTH=LOGIN IDLE UNSELECT UIDPLUS QUOTA ACL\n\
             A001 OK done",
            &mut attrs,
        );
        assert_eq!(attrs.banner, "* OK [CAPABILITY IMAP4rev1] Dovecot ready.");
        assert!(attrs.imap.imap4rev1);
        assert!(attrs.imap.starttls);
        assert!(attrs.imap.auth_plain);
        assert!(attrs.imap.auth_login);
        assert!(attrs.imap.idle);
        assert!(attrs.imap.unselect);
        assert!(attrs.imap.uidplus);
        assert!(attrs.imap.quota);
        assert!(attrs.imap.acl);
        assert!(attrs.imap.capabilities.starts_with("IMAP4rev1"));
    }

    #[test]
    fn preauth_greeting_is_accepted_as_banner() {
        let mut attrs = ProtocolAttributes::default();
        ImapProtocol.parse_capabilities("* PREAUTH ready", &mut attrs);
        assert_eq!(attrs.banner, "* PREAUTH ready");
    }
}
