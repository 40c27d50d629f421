//! Streaming parser for target input: files, directories, CIDR blocks and
//! IPv4 ranges.
//!
//! Input is UTF-8 text, one entry per line. Blank lines and lines starting
//! with `#` or `;` are comments. A line is either a bare domain, a bare
//! IPv4 address, a `addr/prefix` CIDR block, or a CSV row whose first two
//! fields form an inclusive IPv4 range. Expansions are emitted in ascending
//! address order and capped so a stray `0.0.0.0/0` cannot flood the
//! pipeline.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::iter;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use cidr_utils::cidr::Ipv4Cidr;
use either::Either;
use itertools::Itertools;
use log::{error, warn};

/// Hard cap on the number of hosts a single CIDR or range line may expand to.
pub const EXPANSION_CAP: usize = 1_048_576;

/// True for a syntactically valid bare IPv4 literal.
pub fn is_ipv4_literal(token: &str) -> bool {
    Ipv4Addr::from_str(token).is_ok()
}

/// True for anything the scanner treats as an address rather than a domain:
/// a bare IPv4 literal or an `IPv4/PREFIX` block with prefix 0..=32.
pub fn is_valid_ip_address(token: &str) -> bool {
    if is_ipv4_literal(token) {
        return true;
    }
    token.contains('/') && Ipv4Cidr::from_str(token).is_ok()
}

/// Expands one already-trimmed, non-comment input line into target tokens.
///
/// Malformed CIDR and range lines are logged and yield nothing; the stream
/// continues with the remaining input.
pub fn expand_line(line: &str) -> impl Iterator<Item = String> {
    if line.contains('/') {
        let hosts = match Ipv4Cidr::from_str(line) {
            Ok(cidr) => {
                let first = u32::from(cidr.first_as_ipv4_addr());
                let last = u32::from(cidr.last_as_ipv4_addr());
                Some(host_range(first, last))
            }
            Err(_) => {
                warn!("skipping malformed CIDR line: {line:?}");
                None
            }
        };
        return Either::Left(match hosts {
            Some(hosts) => Either::Left(hosts),
            None => Either::Right(iter::empty()),
        });
    }

    if line.contains(',') {
        let bounds = line
            .split(',')
            .take(2)
            .map(str::trim)
            .map(Ipv4Addr::from_str)
            .collect_tuple();
        let hosts = match bounds {
            Some((Ok(start), Ok(end))) => {
                let (mut first, mut last) = (u32::from(start), u32::from(end));
                if first > last {
                    std::mem::swap(&mut first, &mut last);
                }
                Some(host_range(first, last))
            }
            _ => {
                warn!("skipping malformed range line: {line:?}");
                None
            }
        };
        return Either::Left(match hosts {
            Some(hosts) => Either::Left(hosts),
            None => Either::Right(iter::empty()),
        });
    }

    Either::Right(iter::once(line.to_owned()))
}

/// Ascending inclusive `[first, last]` host walk, capped at
/// [`EXPANSION_CAP`] entries.
fn host_range(first: u32, last: u32) -> impl Iterator<Item = String> {
    let count = (u64::from(last) - u64::from(first) + 1).min(EXPANSION_CAP as u64);
    (0..count).map(move |offset| Ipv4Addr::from(first + offset as u32).to_string())
}

/// Streams every target under `path` (a file, or a directory recursed in
/// name order), skipping the first `offset` entries, and feeds each token to
/// `emit`. The walk stops early when `emit` returns `false`.
pub fn stream_targets<F>(path: &Path, offset: usize, emit: &mut F) -> io::Result<()>
where
    F: FnMut(String) -> bool,
{
    let mut remaining_skip = offset;
    stream_path(path, &mut remaining_skip, emit)?;
    Ok(())
}

fn stream_path<F>(path: &Path, skip: &mut usize, emit: &mut F) -> io::Result<bool>
where
    F: FnMut(String) -> bool,
{
    if path.is_dir() {
        let mut entries: Vec<_> = path
            .read_dir()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for entry in entries {
            match stream_path(&entry, skip, emit) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(err) => error!("failed to read {}: {err}", entry.display()),
            }
        }
        return Ok(true);
    }

    let file = File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!("read error in {}: {err}", path.display());
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        for token in expand_line(trimmed) {
            if *skip > 0 {
                *skip -= 1;
                continue;
            }
            if !emit(token) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
