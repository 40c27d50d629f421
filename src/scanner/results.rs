//! The result thread: drains released reports, writes them out and
//! checkpoints progress.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::checkpoint::{utc_timestamp, CheckpointInfo, ProgressStore};
use crate::input::WriteMode;
use crate::queue::BoundedQueue;
use crate::session::ScanReport;

use super::Stats;

/// Idle pause between drain attempts.
const DRAIN_SLEEP: Duration = Duration::from_millis(50);

pub(super) struct ResultContext {
    pub queue: Arc<BoundedQueue<ScanReport>>,
    pub stop: Arc<AtomicBool>,
    pub scan_done: Arc<AtomicBool>,
    pub stats: Arc<Stats>,
    pub write_mode: WriteMode,
    pub flush_interval: Duration,
    pub checkpoint_interval: usize,
    pub output_dir: PathBuf,
    pub progress: ProgressStore,
}

/// Runs until the scheduler is done and the queue is drained. Returns the
/// accumulated reports in final mode; streaming mode writes as it goes and
/// returns nothing.
pub(super) fn run(ctx: ResultContext) -> Vec<ScanReport> {
    let stream_mode = ctx.write_mode == WriteMode::Stream;
    let mut accumulated: Vec<ScanReport> = Vec::new();
    let mut writer: Option<File> = None;
    let mut header_written = false;
    let mut last_flush = Instant::now();
    let mut last_ip = String::new();
    let mut checkpoint_counter = 0usize;

    loop {
        let finished = ctx.stop.load(Ordering::SeqCst) || ctx.scan_done.load(Ordering::SeqCst);
        if finished && ctx.queue.is_empty() {
            break;
        }

        if stream_mode
            && !finished
            && last_flush.elapsed() < ctx.flush_interval
            && ctx.queue.is_empty()
        {
            thread::sleep(DRAIN_SLEEP);
            continue;
        }

        let batch = ctx.queue.drain();
        if batch.is_empty() {
            thread::sleep(DRAIN_SLEEP);
            continue;
        }

        for report in &batch {
            let mut has_success = false;
            {
                let mut counts = ctx.stats.protocol_counts.lock().unwrap();
                for pr in &report.protocols {
                    if pr.accessible {
                        has_success = true;
                        *counts.entry(pr.protocol.clone()).or_insert(0) += 1;
                    }
                }
            }
            if has_success {
                ctx.stats.successful_ips.fetch_add(1, Ordering::SeqCst);
            }
            if report.target.ip.is_empty() {
                ctx.stats.dns_failed.fetch_add(1, Ordering::SeqCst);
            }

            last_ip = report.target.ip.clone();
            checkpoint_counter += 1;
        }

        if stream_mode {
            if writer.is_none() {
                writer = open_stream_writer(&ctx.output_dir, &mut header_written);
            }
            if let Some(file) = writer.as_mut() {
                for report in &batch {
                    // All-failure reports carry nothing worth a block.
                    if report.protocols.is_empty() {
                        continue;
                    }
                    let _ = write!(file, "{}", render_block(report));
                }
                let _ = file.flush();
            }
        } else {
            accumulated.extend(batch);
        }

        if checkpoint_counter >= ctx.checkpoint_interval {
            let checkpoint = CheckpointInfo {
                last_ip: last_ip.clone(),
                processed_count: ctx.stats.total_targets.load(Ordering::SeqCst),
                successful_count: ctx.stats.successful_ips.load(Ordering::SeqCst),
                timestamp: utc_timestamp(),
                input_file_hash: ctx.progress.input_hash().to_owned(),
            };
            ctx.progress.save(&checkpoint);
            checkpoint_counter = 0;
        }

        last_flush = Instant::now();
    }

    if stream_mode {
        if let Some(file) = writer.as_mut() {
            let _ = write!(file, "{}", render_statistics(&ctx.stats));
            let _ = file.flush();
        }
        // A finished streaming run needs no resume point.
        ctx.progress.clear();
    }

    info!("result handler thread finished");
    accumulated
}

fn open_stream_writer(output_dir: &PathBuf, header_written: &mut bool) -> Option<File> {
    let path = output_dir.join("scan_results.txt");
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut file) => {
            if !*header_written {
                let _ = write!(file, "Scan Results\n============\n");
                *header_written = true;
            }
            Some(file)
        }
        Err(err) => {
            warn!("cannot open {}: {err}", path.display());
            None
        }
    }
}

/// Streaming per-report block.
fn render_block(report: &ScanReport) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", report.target.domain, report.target.ip);
    for pr in &report.protocols {
        let _ = write!(out, "  [{}] {}:{}", pr.protocol, pr.host, pr.port);
        if pr.accessible {
            let _ = writeln!(out, " -> OK");
            if !pr.attrs.banner.is_empty() {
                let _ = writeln!(out, "    banner: {}", pr.attrs.banner);
            }
        } else {
            let _ = writeln!(out, " -> FAIL");
        }
    }
    out.push('\n');
    out
}

fn render_statistics(stats: &Stats) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "\n================== Scan Statistics ==================");
    let _ = writeln!(
        out,
        "Total Targets: {}",
        stats.total_targets.load(Ordering::SeqCst)
    );
    let _ = writeln!(
        out,
        "Successful IPs: {}",
        stats.successful_ips.load(Ordering::SeqCst)
    );
    let _ = writeln!(out, "\nProtocol Success Counts:");
    for (protocol, count) in stats.protocol_counts.lock().unwrap().iter() {
        let _ = writeln!(out, "  {protocol}: {count}");
    }
    if let (Some(started), Some(finished)) = (
        *stats.started.lock().unwrap(),
        *stats.finished.lock().unwrap(),
    ) {
        let _ = writeln!(
            out,
            "\nTotal Time: {} ms",
            finished.duration_since(started).as_millis()
        );
    }
    let _ = writeln!(out, "====================================================");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ProtocolResult;
    use crate::session::ScanTarget;

    fn report(domain: &str, ip: &str, protocols: Vec<ProtocolResult>) -> ScanReport {
        ScanReport {
            target: ScanTarget {
                domain: domain.into(),
                ip: ip.into(),
                mx_records: Vec::new(),
                priority: 0,
            },
            protocols,
            total_time: Duration::from_secs(1),
        }
    }

    fn ok_result(protocol: &str, port: u16, banner: &str) -> ProtocolResult {
        let mut pr = ProtocolResult {
            protocol: protocol.into(),
            host: "mail.example".into(),
            port,
            accessible: true,
            ..ProtocolResult::default()
        };
        pr.attrs.banner = banner.into();
        pr
    }

    #[test]
    fn block_shows_ok_fail_and_banner() {
        let block = render_block(&report(
            "mail.example",
            "1.2.3.4",
            vec![
                ok_result("SMTP", 25, "220 ready"),
                ProtocolResult {
                    protocol: "POP3".into(),
                    host: "mail.example".into(),
                    port: 110,
                    ..ProtocolResult::default()
                },
            ],
        ));
        assert!(block.starts_with("mail.example (1.2.3.4)\n"));
        assert!(block.contains("  [SMTP] mail.example:25 -> OK\n"));
        assert!(block.contains("    banner: 220 ready\n"));
        assert!(block.contains("  [POP3] mail.example:110 -> FAIL\n"));
        assert!(block.ends_with("\n\n"));
    }

    #[test]
    fn statistics_block_lists_counts() {
        let stats = Stats::default();
        stats.total_targets.store(5, Ordering::SeqCst);
        stats.successful_ips.store(2, Ordering::SeqCst);
        stats
            .protocol_counts
            .lock()
            .unwrap()
            .insert("SMTP".into(), 3);
        let block = render_statistics(&stats);
        assert!(block.contains("Total Targets: 5"));
        assert!(block.contains("Successful IPs: 2"));
        assert!(block.contains("  SMTP: 3"));
    }

    #[test]
    fn streaming_run_writes_file_and_clears_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("targets.txt");
        std::fs::write(&input, "1.2.3.4\n").unwrap();

        let queue = Arc::new(BoundedQueue::new());
        queue.push(report(
            "mail.example",
            "1.2.3.4",
            vec![ok_result("SMTP", 25, "220 ready")],
        ));
        // Zero-protocol reports are skipped in the stream but still counted.
        queue.push(report("dead.example", "", vec![]));

        let scan_done = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Stats::default());
        let progress = ProgressStore::new(&input, dir.path());
        progress.save(&CheckpointInfo::default());

        let ctx = ResultContext {
            queue,
            stop: Arc::new(AtomicBool::new(false)),
            scan_done,
            stats: Arc::clone(&stats),
            write_mode: WriteMode::Stream,
            flush_interval: Duration::from_millis(10),
            checkpoint_interval: 100,
            output_dir: dir.path().to_path_buf(),
            progress,
        };
        let accumulated = run(ctx);
        assert!(accumulated.is_empty());

        let written = std::fs::read_to_string(dir.path().join("scan_results.txt")).unwrap();
        assert!(written.starts_with("Scan Results\n============\n"));
        assert!(written.contains("mail.example (1.2.3.4)"));
        assert!(!written.contains("dead.example"));
        assert!(written.contains("Scan Statistics"));

        assert_eq!(stats.successful_ips.load(Ordering::SeqCst), 1);
        assert_eq!(stats.dns_failed.load(Ordering::SeqCst), 1);
        // Completed streaming runs delete their checkpoint.
        assert!(!dir.path().join("targets.txt.progress.json").exists());
    }

    #[test]
    fn final_mode_accumulates_reports() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("targets.txt");
        std::fs::write(&input, "1.2.3.4\n").unwrap();

        let queue = Arc::new(BoundedQueue::new());
        queue.push(report("a.example", "1.2.3.4", vec![ok_result("SMTP", 25, "220")]));
        queue.push(report("b.example", "5.6.7.8", vec![]));

        let ctx = ResultContext {
            queue,
            stop: Arc::new(AtomicBool::new(false)),
            scan_done: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(Stats::default()),
            write_mode: WriteMode::Final,
            flush_interval: Duration::from_millis(10),
            checkpoint_interval: 100,
            output_dir: dir.path().to_path_buf(),
            progress: ProgressStore::new(&input, dir.path()),
        };
        let accumulated = run(ctx);
        assert_eq!(accumulated.len(), 2);
        assert!(!dir.path().join("scan_results.txt").exists());
    }

    #[test]
    fn checkpoints_are_written_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("targets.txt");
        std::fs::write(&input, "1.2.3.0/30\n").unwrap();

        let queue = Arc::new(BoundedQueue::new());
        for i in 0..4 {
            queue.push(report(
                &format!("host{i}"),
                &format!("1.2.3.{i}"),
                vec![ok_result("SMTP", 25, "220")],
            ));
        }

        let stats = Arc::new(Stats::default());
        stats.total_targets.store(4, Ordering::SeqCst);

        let ctx = ResultContext {
            queue,
            stop: Arc::new(AtomicBool::new(false)),
            scan_done: Arc::new(AtomicBool::new(true)),
            stats,
            write_mode: WriteMode::Final,
            flush_interval: Duration::from_millis(10),
            checkpoint_interval: 2,
            output_dir: dir.path().to_path_buf(),
            progress: ProgressStore::new(&input, dir.path()),
        };
        run(ctx);

        // Final mode keeps the checkpoint file for a potential resume.
        let store = ProgressStore::new(&input, dir.path());
        let checkpoint = store.load().unwrap();
        assert_eq!(checkpoint.last_ip, "1.2.3.3");
        assert_eq!(checkpoint.processed_count, 4);
        assert!(!checkpoint.timestamp.is_empty());
    }
}
