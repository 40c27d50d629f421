//! Command-line entry point.

use std::fs;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn, LevelFilter};

use bannerscan::input::{Opts, ScannerConfig, WriteMode};
use bannerscan::output::ResultHandler;
use bannerscan::preflight;
use bannerscan::scanner::Scanner;
use bannerscan::session::ScanReport;
use bannerscan::vendor::{host_key, VendorDetector};

fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logging(&opts);

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(opts: &Opts) {
    let level = if opts.verbose {
        LevelFilter::Debug
    } else if opts.quiet {
        LevelFilter::Error
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn run(opts: &Opts) -> Result<()> {
    let Some(input) = &opts.input else {
        bail!("--input is required; see --help");
    };
    if !input.exists() {
        bail!("input path {} does not exist", input.display());
    }

    let mut config = ScannerConfig::resolve(opts);
    config.max_work_count = preflight::check_system_limits(config.max_work_count);

    let mut vendor_detector = load_vendor_detector(&config);

    let scanner = Scanner::new(config.clone());
    scanner.start(input);
    let mut reports = scanner.get_results();

    if let Some(detector) = vendor_detector.as_mut() {
        label_vendors(detector, &mut reports);
    }

    let streaming = config.output_write_mode == WriteMode::Stream;
    if !streaming || config.output_to_console {
        let rendered = render_reports(&config, &reports);

        if config.output_to_console {
            print!("{rendered}");
        }

        if !streaming {
            fs::create_dir_all(&config.output_dir).with_context(|| {
                format!("cannot create output dir {}", config.output_dir.display())
            })?;
            for format in &config.output_formats {
                let mut handler = ResultHandler::new(*format);
                handler.set_only_success(config.only_success);
                let path = config
                    .output_dir
                    .join(format!("scan_results.{}", format.extension()));
                fs::write(&path, handler.reports_to_string(&reports))
                    .with_context(|| format!("cannot write {}", path.display()))?;
                info!("results saved to {}", path.display());
            }
        }
    } else {
        info!(
            "streaming mode: results were written to {}/scan_results.txt",
            config.output_dir.display()
        );
    }

    print_summary(&scanner, vendor_detector.as_ref());

    if let (Some(detector), Some(path)) = (&vendor_detector, vendor_pattern_path(&config)) {
        detector.save_patterns(&path);
    }

    Ok(())
}

fn load_vendor_detector(config: &ScannerConfig) -> Option<VendorDetector> {
    if !config.vendor_enabled {
        return None;
    }
    let path = vendor_pattern_path(config)?;
    let mut detector = VendorDetector::new();
    if detector.load_patterns(&path) {
        Some(detector)
    } else {
        warn!("failed to load vendor patterns from {}", path.display());
        None
    }
}

fn vendor_pattern_path(config: &ScannerConfig) -> Option<std::path::PathBuf> {
    config
        .vendor_pattern_file
        .clone()
        .or_else(|| Some(config.output_dir.join("vendors.json")))
}

fn label_vendors(detector: &mut VendorDetector, reports: &mut [ScanReport]) {
    for report in reports {
        for pr in &mut report.protocols {
            if pr.accessible && !pr.attrs.banner.is_empty() {
                if let Some(id) = detector.detect(&pr.attrs.banner) {
                    if let Some(name) = detector.vendor_name(id) {
                        pr.attrs.vendor = name.to_owned();
                    }
                    detector.record_match(id, host_key(&pr.host, pr.port));
                }
            }
        }
    }
}

fn render_reports(config: &ScannerConfig, reports: &[ScanReport]) -> String {
    let format = config
        .output_formats
        .first()
        .copied()
        .unwrap_or(bannerscan::output::OutputFormat::Text);
    let mut handler = ResultHandler::new(format);
    handler.set_only_success(config.only_success);
    format!(
        "\nScan Results\n============\n{}",
        handler.reports_to_string(reports)
    )
}

fn print_summary(scanner: &Scanner, vendor_detector: Option<&VendorDetector>) {
    let stats = scanner.statistics();
    println!("\n================== Scan Statistics ==================");
    println!("Total Targets: {}", stats.total_targets);
    println!("Successful IPs: {}", stats.successful_ips);
    println!("DNS Failures: {}", stats.dns_failed);
    println!("\nProtocol Success Counts:");
    for (protocol, count) in &stats.protocol_counts {
        println!("  {protocol}: {count}");
    }
    if let Some(detector) = vendor_detector {
        let labelled: Vec<_> = detector
            .statistics()
            .into_iter()
            .filter(|stat| stat.count > 0)
            .collect();
        if !labelled.is_empty() {
            println!("\nVendors:");
            for stat in labelled {
                println!("  {}: {} servers", stat.name, stat.count);
            }
        }
    }
    println!("\nTotal Time: {} ms", stats.total_time.as_millis());
    println!("====================================================");
}
