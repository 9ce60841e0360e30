use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Result of comparing a file's size against the last read offset
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Growth {
    /// The file shrank below the offset (truncated or replaced)
    Truncated { size: u64 },
    /// Nothing new since the last read
    Unchanged,
    /// New bytes were read
    Appended {
        /// Raw bytes starting at the previous offset
        bytes: Vec<u8>,
        /// Offset to record after this read
        next_offset: u64,
        /// Whether unread bytes remain beyond the read cap
        remaining: bool,
    },
}

/// Stat `path` and read whatever was appended after `offset`.
///
/// At most `max_read_bytes` are consumed per call; `remaining` reports
/// whether the caller should check again right away. A capped read ends
/// after its last newline, or on a character boundary when it holds none, so
/// the next read picks up the rest of the line intact.
pub fn check_growth(path: &Path, offset: u64, max_read_bytes: usize) -> io::Result<Growth> {
    let size = std::fs::metadata(path)?.len();

    if size < offset {
        return Ok(Growth::Truncated { size });
    }
    if size == offset {
        return Ok(Growth::Unchanged);
    }

    let limit = (size - offset).min(max_read_bytes.max(1) as u64);
    let mut bytes = read_range(path, offset, limit)?;
    if offset + (bytes.len() as u64) < size {
        let keep = cut_point(&bytes);
        if keep > 0 {
            bytes.truncate(keep);
        }
    }
    let next_offset = offset + bytes.len() as u64;

    Ok(Growth::Appended {
        bytes,
        next_offset,
        remaining: next_offset < size,
    })
}

/// Length of the prefix of a capped read that can be emitted now
fn cut_point(bytes: &[u8]) -> usize {
    match bytes.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => char_boundary(bytes),
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence
fn char_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(4)..len).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if i + width > len { i } else { len };
    }
    len
}

/// Read up to `limit` bytes of `path` starting at `offset`
fn read_range(path: &Path, offset: u64, limit: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(limit as usize);
    file.take(limit).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Split raw bytes into lines, dropping blank ones.
///
/// Bytes are decoded as lossy UTF-8 and a trailing `\r` is removed from
/// each line.
pub fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
