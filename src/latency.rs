//! Adaptive per-subnet round-trip estimation.
//!
//! Probe completions feed observed RTTs back into a per-/24 estimator using
//! the classic Jacobson/Karels smoothed-RTT recurrences. When the configured
//! probe timeout is zero, the scheduler asks the estimator for a deadline
//! instead, so hosts in a fast subnet get tight timeouts while congested
//! subnets keep generous ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Lower clamp for suggested timeouts.
pub const MIN_TIMEOUT_MS: u32 = 800;
/// Upper clamp for suggested timeouts.
pub const MAX_TIMEOUT_MS: u32 = 4000;

const INITIAL_SRTT_US: u32 = 200_000;
const INITIAL_RTTVAR_US: u32 = 50_000;

/// Smoothed RTT state for a single /24.
///
/// Updates race benignly under relaxed ordering; the estimator is
/// statistical and a lost update only delays convergence.
pub struct SubnetLatency {
    srtt_us: AtomicU32,
    rttvar_us: AtomicU32,
}

impl SubnetLatency {
    fn new() -> Self {
        Self {
            srtt_us: AtomicU32::new(INITIAL_SRTT_US),
            rttvar_us: AtomicU32::new(INITIAL_RTTVAR_US),
        }
    }

    fn update(&self, sample_us: u32) {
        let srtt = self.srtt_us.load(Ordering::Relaxed);
        let rttvar = self.rttvar_us.load(Ordering::Relaxed);

        let diff = sample_us as i64 - srtt as i64;
        let abs_diff = diff.unsigned_abs() as u32;

        // RTTVAR <- RTTVAR + (|diff| - RTTVAR) / 4
        let new_rttvar = if abs_diff >= rttvar {
            rttvar + ((abs_diff - rttvar) >> 2)
        } else {
            rttvar - ((rttvar - abs_diff) >> 2)
        };
        self.rttvar_us.store(new_rttvar, Ordering::Relaxed);

        // SRTT <- SRTT + diff / 8
        let new_srtt = (srtt as i64 + (diff >> 3)).max(0) as u32;
        self.srtt_us.store(new_srtt, Ordering::Relaxed);
    }

    fn suggested_timeout(&self) -> Duration {
        let srtt = self.srtt_us.load(Ordering::Relaxed);
        let rttvar = self.rttvar_us.load(Ordering::Relaxed);
        // Timeout = SRTT + 4 * RTTVAR
        let timeout_ms = (srtt.saturating_add(rttvar << 2)) / 1000;
        Duration::from_millis(timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS) as u64)
    }
}

/// Map of /24 prefix to RTT state, shared across all sessions of one scan.
///
/// Reads take the shared lock; a missing bucket upgrades to the exclusive
/// lock with a double-checked insert.
pub struct LatencyEstimator {
    buckets: RwLock<HashMap<String, Arc<SubnetLatency>>>,
}

impl LatencyEstimator {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Records an observed round trip for `ip`'s subnet.
    pub fn update(&self, ip: &str, rtt: Duration) {
        if ip.is_empty() {
            return;
        }
        let key = subnet_key(ip);
        let sample_us = (rtt.as_millis() as u64).saturating_mul(1000).min(u32::MAX as u64) as u32;
        self.bucket(&key).update(sample_us);
    }

    /// Suggested probe deadline for `ip`, clamped to
    /// [[`MIN_TIMEOUT_MS`], [`MAX_TIMEOUT_MS`]].
    pub fn get_timeout(&self, ip: &str) -> Duration {
        if ip.is_empty() {
            return Duration::from_millis(MIN_TIMEOUT_MS as u64);
        }
        self.bucket(&subnet_key(ip)).suggested_timeout()
    }

    fn bucket(&self, key: &str) -> Arc<SubnetLatency> {
        if let Some(bucket) = self.buckets.read().unwrap().get(key) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write().unwrap();
        // Another writer may have inserted between the locks.
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(SubnetLatency::new());
        buckets.insert(key.to_owned(), Arc::clone(&bucket));
        bucket
    }
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// First three dotted octets of an IPv4 address; anything else falls into
/// the shared `"default"` bucket.
fn subnet_key(ip: &str) -> String {
    let mut dots = 0;
    for (index, byte) in ip.bytes().enumerate() {
        if byte == b'.' {
            dots += 1;
            if dots == 3 {
                return ip[..index].to_owned();
            }
        }
    }
    "default".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_key_takes_first_three_octets() {
        assert_eq!(subnet_key("192.168.1.100"), "192.168.1");
        assert_eq!(subnet_key("10.0.0.1"), "10.0.0");
    }

    #[test]
    fn malformed_addresses_share_the_default_bucket() {
        assert_eq!(subnet_key("::1"), "default");
        assert_eq!(subnet_key("not-an-ip"), "default");
    }

    #[test]
    fn timeout_always_within_clamp() {
        let est = LatencyEstimator::new();
        est.update("203.0.113.5", Duration::from_millis(1));
        let fast = est.get_timeout("203.0.113.5");
        est.update("198.51.100.9", Duration::from_secs(30));
        let slow = est.get_timeout("198.51.100.9");
        for t in [fast, slow] {
            assert!(t >= Duration::from_millis(MIN_TIMEOUT_MS as u64));
            assert!(t <= Duration::from_millis(MAX_TIMEOUT_MS as u64));
        }
    }

    #[test]
    fn steady_fast_samples_converge_to_lower_clamp() {
        let est = LatencyEstimator::new();
        for _ in 0..10 {
            est.update("203.0.113.7", Duration::from_millis(120));
        }
        // Converges downward from the 200ms/50ms starting point; the floor
        // clamp takes over well before SRTT reaches the sample value.
        assert_eq!(
            est.get_timeout("203.0.113.9"),
            Duration::from_millis(MIN_TIMEOUT_MS as u64)
        );
    }

    #[test]
    fn hosts_in_one_subnet_share_state() {
        let est = LatencyEstimator::new();
        est.update("203.0.113.1", Duration::from_millis(100));
        let a = est.get_timeout("203.0.113.1");
        let b = est.get_timeout("203.0.113.254");
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_subnet_uses_initial_estimates() {
        let est = LatencyEstimator::new();
        // 200ms SRTT + 4 * 50ms RTTVAR = 400ms, clamped up to the floor.
        assert_eq!(
            est.get_timeout("192.0.2.1"),
            Duration::from_millis(MIN_TIMEOUT_MS as u64)
        );
    }
}
