//! Vendor identification by regex lookup over captured banners.
//!
//! Patterns live in a JSON file of `{id, name, pattern, match_count}`
//! entries. After a scan, accessible banners are matched against each
//! pattern; hits label the result and bump per-vendor statistics, which can
//! be written back so frequently-seen vendors keep their counts across runs.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::warn;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorPattern {
    pub id: u32,
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub match_count: u64,
}

/// Per-vendor tally exposed after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorStat {
    pub name: String,
    pub count: u64,
}

pub struct VendorDetector {
    patterns: Vec<VendorPattern>,
    compiled: Vec<Option<Regex>>,
    matched_hosts: HashMap<u32, HashSet<u64>>,
}

impl VendorDetector {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            compiled: Vec::new(),
            matched_hosts: HashMap::new(),
        }
    }

    /// Loads and compiles the pattern file. Returns `false` when the file is
    /// unreadable or unparseable; individual bad regexes are skipped.
    pub fn load_patterns(&mut self, path: &Path) -> bool {
        let payload = match fs::read_to_string(path) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to read vendor patterns {}: {err}", path.display());
                return false;
            }
        };
        let patterns: Vec<VendorPattern> = match serde_json::from_str(&payload) {
            Ok(patterns) => patterns,
            Err(err) => {
                warn!("failed to parse vendor patterns: {err}");
                return false;
            }
        };

        self.compiled = patterns
            .iter()
            .map(|p| match Regex::new(&p.pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!("invalid vendor pattern {:?}: {err}", p.pattern);
                    None
                }
            })
            .collect();
        self.patterns = patterns;
        true
    }

    /// First pattern matching the banner wins.
    pub fn detect(&self, banner: &str) -> Option<u32> {
        self.patterns
            .iter()
            .zip(&self.compiled)
            .find(|(_, regex)| {
                regex
                    .as_ref()
                    .is_some_and(|regex| regex.is_match(banner))
            })
            .map(|(pattern, _)| pattern.id)
    }

    pub fn vendor_name(&self, id: u32) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
    }

    /// Counts a match, deduplicated per `(vendor, host)` pair so one noisy
    /// host cannot inflate a vendor's tally.
    pub fn record_match(&mut self, id: u32, host_key: u64) {
        let hosts = self.matched_hosts.entry(id).or_default();
        if hosts.insert(host_key) {
            if let Some(pattern) = self.patterns.iter_mut().find(|p| p.id == id) {
                pattern.match_count += 1;
            }
        }
    }

    pub fn statistics(&self) -> Vec<VendorStat> {
        self.patterns
            .iter()
            .map(|p| VendorStat {
                name: p.name.clone(),
                count: p.match_count,
            })
            .collect()
    }

    pub fn save_patterns(&self, path: &Path) -> bool {
        match serde_json::to_string_pretty(&self.patterns) {
            Ok(payload) => fs::write(path, payload)
                .map_err(|err| warn!("failed to save vendor patterns: {err}"))
                .is_ok(),
            Err(err) => {
                warn!("failed to serialize vendor patterns: {err}");
                false
            }
        }
    }
}

impl Default for VendorDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable key for a `host:port` pair, used to deduplicate match counts.
pub fn host_key(host: &str, port: u16) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    port.hash(&mut hasher);
    hasher.finish()
}
