//! Recipient ingestion: a byte-throttled, forward-only stream of parsed rows.
//!
//! Every non-blank line after the header yields exactly one record. Rows that
//! fail validation are kept as invalid records carrying the original text so
//! they can be accounted for in the invalid sink.

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::Path,
    str::FromStr,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

const MIN_COLUMNS: usize = 2;

/// A token amount held exactly, in the mint's base units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenAmount {
    pub base_units: u64,
    pub decimals: u8,
}

impl TokenAmount {
    /// Parses a plain decimal such as `12`, `0.5` or `1.250`.
    ///
    /// Returns `None` for signs, exponents, more significant fractional digits
    /// than `decimals` allows, or a value that does not fit in `u64` base units.
    pub fn parse(text: &str, decimals: u8) -> Option<Self> {
        let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > decimals as usize {
            return None;
        }

        let scale = 10u64.checked_pow(decimals as u32)?;
        let whole_units = if whole.is_empty() { 0 } else { whole.parse::<u64>().ok()? };
        let fraction_units = if fraction.is_empty() {
            0
        } else {
            let pad = 10u64.checked_pow((decimals as usize - fraction.len()) as u32)?;
            fraction.parse::<u64>().ok()?.checked_mul(pad)?
        };
        let base_units = whole_units.checked_mul(scale)?.checked_add(fraction_units)?;
        Some(Self { base_units, decimals })
    }
}

impl std::fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digits = format!("{:0>width$}", self.base_units, width = self.decimals as usize + 1);
        let (whole, fraction) = digits.split_at(digits.len() - self.decimals as usize);
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            write!(f, "{whole}")
        } else {
            write!(f, "{whole}.{fraction}")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipientRecord {
    /// 1-based line number in the input file.
    pub line_number: usize,
    pub amount: TokenAmount,
    pub address: Pubkey,
    pub display_name: String,
    pub email: String,
    pub raw_line: String,
    pub is_valid: bool,
}

impl RecipientRecord {
    pub fn valid(
        line_number: usize,
        amount: TokenAmount,
        address: Pubkey,
        display_name: &str,
        email: &str,
        raw_line: &str,
    ) -> Self {
        Self {
            line_number,
            amount,
            address,
            display_name: display_name.to_string(),
            email: email.to_string(),
            raw_line: raw_line.to_string(),
            is_valid: true,
        }
    }

    pub fn invalid(line_number: usize, raw_line: &str) -> Self {
        Self {
            line_number,
            amount: TokenAmount::default(),
            address: Pubkey::default(),
            display_name: String::new(),
            email: String::new(),
            raw_line: raw_line.to_string(),
            is_valid: false,
        }
    }

    /// Amount in the mint's base units.
    pub fn base_units(&self) -> u64 {
        self.amount.base_units
    }
}

fn split_columns(line: &str) -> Option<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    let record = reader.records().next()?.ok()?;
    Some(record.iter().map(str::to_string).collect())
}

/// Maps one raw CSV line to a record. Never fails: anything malformed becomes
/// an invalid record.
pub fn parse_row(line_number: usize, raw_line: &str, decimals: u8) -> RecipientRecord {
    let columns = match split_columns(raw_line) {
        Some(columns) if columns.len() >= MIN_COLUMNS => columns,
        _ => return RecipientRecord::invalid(line_number, raw_line),
    };
    let amount = match TokenAmount::parse(&columns[0], decimals) {
        Some(amount) => amount,
        None => return RecipientRecord::invalid(line_number, raw_line),
    };
    let address = match Pubkey::from_str(&columns[1]) {
        Ok(address) => address,
        Err(_) => return RecipientRecord::invalid(line_number, raw_line),
    };
    let display_name = columns.get(2).map(String::as_str).unwrap_or("");
    let email = columns.get(3).map(String::as_str).unwrap_or("");
    RecipientRecord::valid(line_number, amount, address, display_name, email, raw_line)
}

/// Caps the rate bytes are pulled from the inner reader.
pub struct ThrottledReader<R> {
    inner: R,
    bytes_per_second: u64,
    started: Instant,
    consumed: u64,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(inner: R, bytes_per_second: u64) -> Self {
        Self { inner, bytes_per_second: bytes_per_second.max(1), started: Instant::now(), consumed: 0 }
    }

    fn chunk_limit(&self) -> usize {
        // Read at most a tenth of a second's worth at a time so pauses stay short.
        (self.bytes_per_second / 10).max(1) as usize
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let due = Duration::from_secs_f64(self.consumed as f64 / self.bytes_per_second as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
        let limit = buf.len().min(self.chunk_limit());
        let n = self.inner.read(&mut buf[..limit])?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Lazy iterator over the records of a recipients file.
///
/// Restartable only by opening the file again.
pub struct RecipientStream<R> {
    lines: io::Split<BufReader<R>>,
    line_number: usize,
    /// Mint decimals amounts are validated against.
    decimals: u8,
}

impl RecipientStream<ThrottledReader<File>> {
    pub fn open(path: &Path, bytes_per_second: u64, decimals: u8) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open recipients file {}", path.display()))?;
        Ok(Self::from_reader(ThrottledReader::new(file, bytes_per_second), decimals))
    }
}

impl<R: Read> RecipientStream<R> {
    pub fn from_reader(reader: R, decimals: u8) -> Self {
        Self { lines: BufReader::new(reader).split(b'\n'), line_number: 0, decimals }
    }
}

impl<R: Read> Iterator for RecipientStream<R> {
    type Item = io::Result<RecipientRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            self.line_number += 1;
            if self.line_number == 1 {
                continue; // header
            }
            let bytes = line.strip_suffix(b"\r").unwrap_or(&line[..]);
            let record = match std::str::from_utf8(bytes) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => parse_row(self.line_number, text, self.decimals),
                Err(_) => RecipientRecord::invalid(self.line_number, &String::from_utf8_lossy(bytes)),
            };
            return Some(Ok(record));
        }
    }
}

/// Runs the blocking stream on its own thread, feeding a bounded channel.
///
/// The channel fills when workers fall behind, which in turn pauses reading.
/// Reading stops after the first IO error or once the receiver is dropped.
pub fn spawn_stream<R>(stream: RecipientStream<R>, capacity: usize) -> mpsc::Receiver<io::Result<RecipientRecord>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::task::spawn_blocking(move || {
        for item in stream {
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });
    rx
}
