//! Durable scan progress for crash resume.
//!
//! Every `checkpoint_interval` released reports the result thread snapshots
//! `{last_ip, counts, timestamp, input hash}` next to the output files. On
//! the next run against the same input file the input thread skips forward
//! to just past `last_ip`. The input hash is a cheap fingerprint (size,
//! mtime, first-KiB hash), not a cryptographic digest; it only needs to
//! catch "this is a different file".

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub last_ip: String,
    pub processed_count: u64,
    pub successful_count: u64,
    pub timestamp: String,
    pub input_file_hash: String,
}

/// Reads and writes the `<input_basename>.progress.json` checkpoint file.
pub struct ProgressStore {
    checkpoint_file: PathBuf,
    input_hash: String,
}

impl ProgressStore {
    pub fn new(input_path: &Path, output_dir: &Path) -> Self {
        let basename = input_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_owned());
        let checkpoint_file = output_dir.join(format!("{basename}.progress.json"));
        debug!("checkpoint file: {}", checkpoint_file.display());
        Self {
            checkpoint_file,
            input_hash: compute_file_hash(input_path),
        }
    }

    /// Fingerprint of the current input file, stored with each checkpoint.
    pub fn input_hash(&self) -> &str {
        &self.input_hash
    }

    pub fn path(&self) -> &Path {
        &self.checkpoint_file
    }

    /// Writes the checkpoint atomically: temp file in the same directory,
    /// then rename over the target.
    pub fn save(&self, info: &CheckpointInfo) -> bool {
        let payload = match serde_json::to_string_pretty(info) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to serialize checkpoint: {err}");
                return false;
            }
        };
        let temp = self.checkpoint_file.with_extension("json.tmp");
        if let Err(err) = fs::write(&temp, payload) {
            warn!("failed to write checkpoint: {err}");
            return false;
        }
        if let Err(err) = fs::rename(&temp, &self.checkpoint_file) {
            warn!("failed to commit checkpoint: {err}");
            let _ = fs::remove_file(&temp);
            return false;
        }
        debug!(
            "checkpoint saved: {} ({} processed, {} successful)",
            info.last_ip, info.processed_count, info.successful_count
        );
        true
    }

    pub fn load(&self) -> Option<CheckpointInfo> {
        let payload = fs::read_to_string(&self.checkpoint_file).ok()?;
        match serde_json::from_str(&payload) {
            Ok(info) => Some(info),
            Err(err) => {
                warn!("failed to parse checkpoint: {err}");
                None
            }
        }
    }

    /// The checkpoint to resume from, if one exists and was written against
    /// an identical input file.
    pub fn resume_point(&self) -> Option<CheckpointInfo> {
        let info = self.load()?;
        if info.input_file_hash != self.input_hash {
            info!("checkpoint ignored: input file changed since it was written");
            return None;
        }
        if info.last_ip.is_empty() {
            return None;
        }
        info!(
            "checkpoint loaded: {} (processed: {}, successful: {})",
            info.last_ip, info.processed_count, info.successful_count
        );
        Some(info)
    }

    pub fn clear(&self) {
        if self.checkpoint_file.exists() {
            match fs::remove_file(&self.checkpoint_file) {
                Ok(()) => info!("checkpoint cleared: {}", self.checkpoint_file.display()),
                Err(err) => warn!("failed to clear checkpoint: {err}"),
            }
        }
    }
}

/// Size + mtime + first-KiB hash, hex-concatenated.
pub fn compute_file_hash(path: &Path) -> String {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("failed to stat {} for hashing: {err}", path.display());
            return String::new();
        }
    };
    let size = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());

    let mut header = vec![0u8; 1024.min(size as usize)];
    if let Ok(mut file) = fs::File::open(path) {
        let _ = file.read(&mut header);
    }
    let mut hasher = DefaultHasher::new();
    header.hash(&mut hasher);

    format!("{size:x}_{mtime}_{:x}", hasher.finish())
}

/// Current UTC time as `YYYY-MM-DD HH:MM:SS`.
pub fn utc_timestamp() -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}
