//! Content fingerprint of a recipients file, stored as a trailing header column
//! so a later run can tell the file was already processed.

use anyhow::{Context, Result};
use solana_sdk::hash::Hasher;
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

const HASH_HEX_LEN: usize = 64;

fn is_fingerprint(column: &str) -> bool {
    column.len() == HASH_HEX_LEN && column.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Splits the header line (terminator included) from the rest of the file.
fn split_header(reader: &mut impl BufRead) -> Result<Vec<u8>> {
    let mut header = Vec::new();
    reader.read_until(b'\n', &mut header)?;
    Ok(header)
}

/// SHA-256 of every byte after the header line, hex encoded.
pub fn body_hash(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    split_header(&mut reader)?;

    let mut hasher = Hasher::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.hash(&chunk[..n]);
    }
    Ok(hex::encode(hasher.result().to_bytes()))
}

/// The fingerprint recorded in the header, if there is one.
pub fn header_hash(path: &Path) -> Result<Option<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let header = split_header(&mut BufReader::new(file))?;
    let header = String::from_utf8_lossy(&header);
    let last = header.trim_end_matches(['\r', '\n']).rsplit(',').next().unwrap_or("").trim();
    Ok(is_fingerprint(last).then(|| last.to_lowercase()))
}

/// True when the file carries a fingerprint that still matches its body.
pub fn already_processed(path: &Path) -> Result<bool> {
    match header_hash(path)? {
        Some(recorded) => Ok(recorded == body_hash(path)?),
        None => Ok(false),
    }
}

/// Writes `hash` as the last header column, replacing an older fingerprint.
/// The body is copied through untouched and the file is swapped in by rename.
pub fn annotate(path: &Path, hash: &str) -> Result<()> {
    let original = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let header_end = original.iter().position(|b| *b == b'\n').map_or(original.len(), |i| i + 1);
    let (header, body) = original.split_at(header_end);

    let header = String::from_utf8_lossy(header);
    let content = header.trim_end_matches(['\r', '\n']);
    let terminator = &header[content.len()..];
    let columns = match content.rsplit_once(',') {
        Some((rest, last)) if is_fingerprint(last.trim()) => rest,
        _ => content,
    };
    let terminator = if terminator.is_empty() { "\n" } else { terminator };

    let mut annotated = format!("{columns},{hash}{terminator}").into_bytes();
    annotated.extend_from_slice(body);

    let staging = staging_path(path);
    fs::write(&staging, &annotated).with_context(|| format!("Failed to write {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
