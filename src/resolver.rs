//! DNS resolution for scan targets.
//!
//! Sessions resolve synchronously during construction, so the resolver is a
//! plain blocking trait. The production implementation wraps
//! [`hickory_resolver`]'s blocking resolver, deriving configuration from the
//! system (`/etc/resolv.conf` on *nix) and falling back to Cloudflare when
//! no usable system configuration exists.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::Resolver;
use log::{debug, warn};

/// A single DNS record surfaced alongside the resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
    pub priority: u16,
}

/// Outcome of resolving one domain: the first A record, any MX records, and
/// an error message when nothing resolved.
#[derive(Debug, Clone, Default)]
pub struct DnsResult {
    pub domain: String,
    pub ip: String,
    pub records: Vec<DnsRecord>,
    pub error: String,
    pub success: bool,
}

/// Blocking resolver interface, injectable so the pipeline can be driven by
/// a stub in tests.
pub trait Resolve: Send + Sync {
    fn resolve(&self, domain: &str, timeout: Duration) -> DnsResult;
}

/// System-configured resolver with a Cloudflare fallback.
pub struct SystemResolver {
    resolver: Resolver,
    max_mx_records: usize,
}

impl SystemResolver {
    pub fn new(timeout: Duration, max_mx_records: usize) -> Self {
        let (config, mut opts) =
            hickory_resolver::system_conf::read_system_conf().unwrap_or_else(|err| {
                warn!("no usable system resolver config ({err}); falling back to Cloudflare");
                (ResolverConfig::cloudflare(), ResolverOpts::default())
            });
        opts.timeout = timeout;
        opts.attempts = 1;

        let resolver =
            Resolver::new(config, opts).expect("resolver construction cannot fail");
        Self {
            resolver,
            max_mx_records,
        }
    }
}

impl Resolve for SystemResolver {
    fn resolve(&self, domain: &str, _timeout: Duration) -> DnsResult {
        let mut result = DnsResult {
            domain: domain.to_owned(),
            ..DnsResult::default()
        };

        match self.resolver.lookup_ip(domain) {
            Ok(lookup) => {
                // Prefer the first IPv4 answer; the prober dials IPv4 only.
                if let Some(ip) = lookup.iter().find(IpAddr::is_ipv4) {
                    result.ip = ip.to_string();
                    result.success = true;
                    result.records.push(DnsRecord {
                        name: domain.to_owned(),
                        record_type: "A".to_owned(),
                        value: result.ip.clone(),
                        ttl: 0,
                        priority: 0,
                    });
                } else {
                    result.error = format!("no IPv4 address for {domain}");
                }
            }
            Err(err) => {
                result.error = err.to_string();
            }
        }

        if result.success {
            match self.resolver.mx_lookup(domain) {
                Ok(lookup) => {
                    for mx in lookup.iter().take(self.max_mx_records) {
                        result.records.push(DnsRecord {
                            name: domain.to_owned(),
                            record_type: "MX".to_owned(),
                            value: mx.exchange().to_utf8(),
                            ttl: 0,
                            priority: mx.preference(),
                        });
                    }
                }
                Err(err) => debug!("MX lookup failed for {domain}: {err}"),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test double that scripts resolution outcomes per domain.
    pub struct ScriptedResolver {
        pub answers: std::collections::HashMap<String, String>,
    }

    impl Resolve for ScriptedResolver {
        fn resolve(&self, domain: &str, _timeout: Duration) -> DnsResult {
            match self.answers.get(domain) {
                Some(ip) => DnsResult {
                    domain: domain.to_owned(),
                    ip: ip.clone(),
                    success: true,
                    ..DnsResult::default()
                },
                None => DnsResult {
                    domain: domain.to_owned(),
                    error: "NXDOMAIN".to_owned(),
                    ..DnsResult::default()
                },
            }
        }
    }

    #[test]
    fn scripted_resolver_round_trip() {
        let mut answers = std::collections::HashMap::new();
        answers.insert("mail.example".to_owned(), "192.0.2.5".to_owned());
        let resolver = ScriptedResolver { answers };

        let hit = resolver.resolve("mail.example", Duration::from_secs(1));
        assert!(hit.success);
        assert_eq!(hit.ip, "192.0.2.5");

        let miss = resolver.resolve("other.example", Duration::from_secs(1));
        assert!(!miss.success);
        assert!(miss.ip.is_empty());
        assert_eq!(miss.error, "NXDOMAIN");
    }
}
