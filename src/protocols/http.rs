//! HTTP HEAD probe.
//!
//! Sends a curl-shaped `HEAD /` request with the target's name in the Host
//! header and parses the status line, `Server:` and `Content-Type:`
//! headers. When the server identifies itself generically (or not at all)
//! or answers with an error status, the body is searched for well-known
//! server signatures to sharpen the banner.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{probe_with, Port, Protocol, ProtocolAttributes, ProtocolResult};

const MAX_RESPONSE_BYTES: usize = 16 * 1024;
const SERVER_SIGNATURES: [&str; 4] = ["nginx/", "apache/", "iis/", "litespeed"];

pub struct HttpProtocol;

#[async_trait]
impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    fn default_ports(&self) -> &'static [Port] {
        &[80, 443, 8080, 8443]
    }

    async fn probe(&self, host: &str, ip: &str, port: Port, timeout: std::time::Duration) -> ProtocolResult {
        let target = host.to_owned();
        probe_with(self.name(), host.to_owned(), ip, port, timeout, move |stream| {
            exchange(stream, target)
        })
        .await
    }

    fn parse_capabilities(&self, response: &str, attrs: &mut ProtocolAttributes) {
        for line in response.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            if attrs.http.status_code == 0 && starts_with_ignore_case(line, "HTTP/") {
                if let Some((_, rest)) = line.split_once(' ') {
                    attrs.http.status_code = rest.get(..3).and_then(|c| c.parse().ok()).unwrap_or(0);
                }
            } else if let Some(value) = strip_header(line, "Server") {
                attrs.http.server = value.to_owned();
            } else if let Some(value) = strip_header(line, "Content-Type") {
                attrs.http.content_type = value.to_owned();
            }
        }
    }
}

async fn exchange(mut stream: TcpStream, target: String) -> Result<ProtocolAttributes, String> {
    let request = format!(
        "HEAD / HTTP/1.1\r\nHost: {target}\r\nUser-Agent: curl/8.7.1\r\nAccept: */*\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| format!("Write request failed: {err}"))?;

    let mut response = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| format!("Read response failed: {err}"))?;
        if read == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..read]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") || response.len() >= MAX_RESPONSE_BYTES {
            break;
        }
    }
    if response.is_empty() {
        return Err("Empty HTTP response".to_owned());
    }

    let text = String::from_utf8_lossy(&response).into_owned();
    let mut attrs = ProtocolAttributes::default();
    HttpProtocol.parse_capabilities(&text, &mut attrs);

    let status_line = text.lines().next().unwrap_or("").trim_end_matches('\r');
    let mut banner = status_line.to_owned();
    if !attrs.http.server.is_empty() {
        banner.push_str(&format!(" [{}]", attrs.http.server));
    }

    // Generic fronting layers hide the real server; go digging in the body.
    let generic = attrs.http.server.is_empty()
        || attrs.http.server.contains("Lego")
        || attrs.http.server.contains("NWS");
    if attrs.http.status_code >= 400 || generic {
        if let Some(found) = find_signature(&text) {
            banner.push_str(&format!(" (Detected: {found})"));
        }
    }
    attrs.banner = banner;
    Ok(attrs)
}

fn find_signature(response: &str) -> Option<String> {
    let lower = response.to_ascii_lowercase();
    for signature in SERVER_SIGNATURES {
        if let Some(pos) = lower.find(signature) {
            let end = response[pos..]
                .find([' ', '\r', '\n', '<', '"'])
                .map_or(response.len(), |offset| pos + offset);
            return Some(response[pos..end].to_owned());
        }
    }
    None
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_headers_are_extracted() {
        let mut attrs = ProtocolAttributes::default();
        HttpProtocol.parse_capabilities(
            "HTTP/1.1 200 OK\r\nServer: nginx/1.24.0\r\nContent-Type: text/html\r\n\r\nignored body",
            &mut attrs,
        );
        assert_eq!(attrs.http.status_code, 200);
        assert_eq!(attrs.http.server, "nginx/1.24.0");
        assert_eq!(attrs.http.content_type, "text/html");
    }

    #[test]
    fn headers_after_blank_line_are_body() {
        let mut attrs = ProtocolAttributes::default();
        HttpProtocol.parse_capabilities(
            "HTTP/1.1 404 Not Found\r\n\r\nServer: fake/1.0",
            &mut attrs,
        );
        assert_eq!(attrs.http.status_code, 404);
        assert!(attrs.http.server.is_empty());
    }

    #[test]
    fn header_names_match_case_insensitively() {
        let mut attrs = ProtocolAttributes::default();
        HttpProtocol.parse_capabilities("HTTP/1.1 301 Moved\r\nserver: Apache/2.4\r\n", &mut attrs);
        assert_eq!(attrs.http.server, "Apache/2.4");
    }

    #[test]
    fn body_signature_search_finds_versions() {
        let body = "HTTP/1.1 502 Bad Gateway\r\n\r\n<html><center>nginx/1.18.0</center></html>";
        assert_eq!(find_signature(body).as_deref(), Some("nginx/1.18.0"));
    }

    #[test]
    fn signature_search_is_case_insensitive_but_preserves_case() {
        let body = "error page served by Apache/2.4.57 today";
        assert_eq!(find_signature(body).as_deref(), Some("Apache/2.4.57"));
    }
}
