//! Startup resource checks.
//!
//! Every in-flight probe holds one socket, so the session cap has to fit
//! inside the process file-descriptor budget. Preflight raises the soft
//! limit as far as it can and derives a safe `max_work_count` from whatever
//! limit sticks.

use log::{info, warn};
use rlimit::Resource;

/// Descriptors held back for logging, DNS, output files and the runtime.
pub const RESERVED_FDS: u64 = 150;

const TARGET_FD_LIMIT: u64 = 65_535;
const MIN_WORK_COUNT: u64 = 100;
const MAX_WORK_COUNT: u64 = 50_000;

/// Raises the FD soft limit (to the hard limit, then best-effort to
/// [`TARGET_FD_LIMIT`]) and returns a `max_work_count` that fits the final
/// budget. A configured nonzero value is kept when it already fits.
pub fn check_system_limits(configured_max_work: usize) -> usize {
    let (soft, hard) = match Resource::NOFILE.get() {
        Ok(limits) => limits,
        Err(err) => {
            warn!("cannot read FD limits ({err}); capping max_work_count conservatively");
            return if configured_max_work == 0 {
                1_000
            } else {
                configured_max_work.min(1_000)
            };
        }
    };

    let mut soft = soft;
    if soft < hard {
        match Resource::NOFILE.set(hard, hard) {
            Ok(()) => {
                info!("raised FD limit from {soft} to {hard}");
                soft = hard;
            }
            Err(err) => warn!("failed to raise FD limit from {soft} to {hard}: {err}"),
        }
    }
    if soft < TARGET_FD_LIMIT {
        let new_hard = hard.max(TARGET_FD_LIMIT);
        if Resource::NOFILE.set(TARGET_FD_LIMIT, new_hard).is_ok() {
            info!("raised FD limit to {TARGET_FD_LIMIT}");
            soft = TARGET_FD_LIMIT;
        }
    }

    let usable = soft.saturating_sub(RESERVED_FDS);
    info!("system FD limit: {soft} (usable: {usable})");
    if soft < 1_024 {
        warn!("file descriptor limit is very low ({soft}); run 'ulimit -n 65535' to fix");
    }

    if configured_max_work != 0 && (configured_max_work as u64) <= usable {
        return configured_max_work;
    }

    let suggested = MIN_WORK_COUNT.max(MAX_WORK_COUNT.min(usable));
    if configured_max_work != 0 {
        warn!(
            "configured max_work_count ({configured_max_work}) exceeds the FD budget ({usable}); capped to {suggested}"
        );
    } else {
        info!("auto-setting max_work_count to {suggested} from the FD limit");
    }
    suggested as usize
}
