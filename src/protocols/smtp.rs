//! SMTP banner and EHLO capability exchange.
//!
//! The probe reads the `220` greeting, sends `EHLO scanner`, then collects
//! `250-` continuation lines until the terminal `250 ` line, folding each
//! announced keyword into [`SmtpAttributes`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{chomp, probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

pub struct SmtpProtocol;

#[async_trait]
impl Protocol for SmtpProtocol {
    fn name(&self) -> &'static str {
        "SMTP"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[25, 465, 587, 2525]
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(5000)
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: Duration) -> ProtocolResult {
        probe_with(self.name(), host.to_owned(), ip, port, timeout, exchange).await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        for line in response.lines() {
            if line.starts_with("220") {
                attrs.banner = line.to_owned();
                continue;
            }
            parse_ehlo_line(line, attrs);
        }
    }
}

async fn exchange(stream: TcpStream) -> Result<ProtocolAttributes, String> {
    let mut attrs = ProtocolAttributes::default();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut welcome = String::new();
    reader
        .read_line(&mut welcome)
        .await
        .map_err(|err| format!("Read banner failed: {err}"))?;
    chomp(&mut welcome);
    if !welcome.starts_with("220") {
        return Err(format!("Invalid welcome: {welcome}"));
    }
    attrs.banner = welcome;

    write_half
        .write_all(b"EHLO scanner\r\n")
        .await
        .map_err(|err| format!("Write EHLO failed: {err}"))?;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|err| format!("Read EHLO failed: {err}"))?;
        if read == 0 {
            return Err("EHLO response truncated".to_owned());
        }
        chomp(&mut line);
        parse_ehlo_line(&line, &mut attrs);
        if line.starts_with("250 ") {
            return Ok(attrs);
        }
    }
}

fn parse_ehlo_line(line: &str, attrs: &mut ProtocolAttributes) {
    let capability = if let Some(rest) = line.strip_prefix("250-") {
        rest
    } else if let Some(rest) = line.strip_prefix("250 ") {
        rest
    } else {
        return;
    };

    match capability {
        "PIPELINING" => attrs.smtp.pipelining = true,
        "STARTTLS" => attrs.smtp.starttls = true,
        "8BITMIME" => attrs.smtp.eightbitmime = true,
        "DSN" => attrs.smtp.dsn = true,
        "SMTPUTF8" => attrs.smtp.utf8 = true,
        other if other.starts_with("SIZE") => parse_size(other, attrs),
        other if other.starts_with("AUTH") => parse_auth(other, attrs),
        _ => {}
    }
}

fn parse_size(value: &str, attrs: &mut ProtocolAttributes) {
    if let Some((_, size)) = value.split_once(' ') {
        match size.parse() {
            Ok(limit) => {
                attrs.smtp.size_limit = limit;
                attrs.smtp.size_supported = true;
            }
            Err(_) => log::warn!("failed to parse SIZE: {size}"),
        }
    }
}

fn parse_auth(value: &str, attrs: &mut ProtocolAttributes) {
    if let Some((_, methods)) = value.split_once(' ') {
        attrs.smtp.auth_methods = methods.to_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(response: &str) -> ProtocolAttributes {
        let mut attrs = ProtocolAttributes::default();
        SmtpProtocol.parse_capabilities(response, &mut attrs);
        attrs
    }

    #[test]
    fn banner_and_features_from_ehlo_transcript() {
        let attrs = parsed(
            "220 mail.example ESMTP Postfix\n\
             250-mail.example\n\
             250-PIPELINING\n\
             250-SIZE 10240000\n\
             250-STARTTLS\n\
             250-AUTH PLAIN LOGIN\n\
             250-8BITMIME\n\
             250 DSN\n",
        );
        assert_eq!(attrs.banner, "220 mail.example ESMTP Postfix");
        assert!(attrs.smtp.pipelining);
        assert!(attrs.smtp.starttls);
        assert!(attrs.smtp.eightbitmime);
        assert!(attrs.smtp.dsn);
        assert!(attrs.smtp.size_supported);
        assert_eq!(attrs.smtp.size_limit, 10_240_000);
        assert_eq!(attrs.smtp.auth_methods, "PLAIN LOGIN");
    }

    #[test]
    fn smtputf8_and_bare_size() {
        let attrs = parsed("250-SMTPUTF8\n250 SIZE\n");
        assert!(attrs.smtp.utf8);
        // SIZE without a value announces nothing parseable.
        assert!(!attrs.smtp.size_supported);
    }

    #[test]
    fn non_ehlo_lines_are_ignored() {
        let attrs = parsed("500 syntax error\n354 go ahead\n");
        assert_eq!(attrs, ProtocolAttributes::default());
    }

    #[test]
    fn default_ports_cover_submission_and_relay() {
        assert_eq!(SmtpProtocol.default_ports(), &[25, 465, 587, 2525]);
    }
}
