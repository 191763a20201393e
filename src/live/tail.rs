//! Offset-based reads of JSON lines files that are still being written

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::record::MetricPoint;

/// Leading bytes remembered to recognise a file rewritten in place
const HEAD_BYTES: usize = 128;

/// Block size for backward newline scans
const SCAN_BLOCK: u64 = 64 * 1024;

/// Where a reader stopped in a file
///
/// `head` holds the first bytes of the file as seen at that point. A WAL
/// truncated and refilled past `offset` keeps a valid line boundary there
/// but starts with a different line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub(crate) struct TailPos {
    pub offset: u64,
    head: Vec<u8>,
}

/// Points read from a file and the position to continue from
#[derive(Debug, Clone, Default)]
pub(crate) struct Chunk {
    pub points: Vec<MetricPoint>,
    pub pos: TailPos,
    /// The file no longer matched the previous position and was reread
    /// from the start
    pub restarted: bool,
}

fn read_head(file: &mut File, len: u64) -> std::io::Result<Vec<u8>> {
    let mut head = vec![0u8; len.min(HEAD_BYTES as u64) as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut head)?;
    Ok(head)
}

/// Read complete lines appended after `pos`
///
/// A file shorter than the recorded offset, or one whose leading bytes
/// changed, was truncated (WAL compaction) and is read from the start. A
/// trailing line without a newline is left for the next read.
pub(crate) fn read_from(path: &Path, pos: &TailPos) -> std::io::Result<Chunk> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Chunk {
                restarted: pos.offset > 0,
                ..Chunk::default()
            })
        }
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let rewritten = pos.offset > 0
        && (len < pos.offset
            || !ends_line_at(&mut file, pos.offset)?
            || !read_head(&mut file, len)?.starts_with(&pos.head));
    let start = if rewritten {
        tracing::debug!(path = %path.display(), offset = pos.offset, len, "file truncated, rereading from start");
        0
    } else {
        pos.offset
    };
    let head = read_head(&mut file, len)?;
    if len == start {
        return Ok(Chunk {
            points: Vec::new(),
            pos: TailPos { offset: start, head },
            restarted: rewritten,
        });
    }

    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let complete = buf.iter().rposition(|&b| b == b'\n').map_or(0, |idx| idx + 1);
    Ok(Chunk {
        points: parse_lines(&buf[..complete]),
        pos: TailPos {
            offset: start + complete as u64,
            head,
        },
        restarted: rewritten,
    })
}

/// Catch-up read: the whole file, or only its last `tail_bytes` when it is
/// larger than `threshold`
pub(crate) fn read_catch_up(path: &Path, threshold: u64, tail_bytes: u64) -> std::io::Result<Chunk> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Chunk::default()),
        Err(e) => return Err(e),
    };
    if len <= threshold || tail_bytes >= len {
        return read_from(path, &TailPos::default());
    }

    // start one byte early so a window beginning exactly on a line
    // boundary keeps its first line
    let window_start = len - tail_bytes - 1;
    let mut file = File::open(path)?;
    let head = read_head(&mut file, len)?;
    file.seek(SeekFrom::Start(window_start))?;
    let mut buf = Vec::with_capacity(tail_bytes as usize + 1);
    file.read_to_end(&mut buf)?;

    let Some(first_newline) = buf.iter().position(|&b| b == b'\n') else {
        // the window sits inside one unfinished line; resume at its start
        let offset = line_start_before(&mut file, window_start)?;
        return Ok(Chunk {
            points: Vec::new(),
            pos: TailPos { offset, head },
            restarted: false,
        });
    };
    let body = &buf[first_newline + 1..];
    let complete = body.iter().rposition(|&b| b == b'\n').map_or(0, |idx| idx + 1);
    tracing::debug!(path = %path.display(), len, tail_bytes, "catching up from file tail");
    Ok(Chunk {
        points: parse_lines(&body[..complete]),
        pos: TailPos {
            offset: window_start + (first_newline + 1 + complete) as u64,
            head,
        },
        restarted: false,
    })
}

/// Offset just past the last newline before `end`, or 0
fn line_start_before(file: &mut File, end: u64) -> std::io::Result<u64> {
    let mut block_end = end;
    while block_end > 0 {
        let block_start = block_end.saturating_sub(SCAN_BLOCK);
        let mut buf = vec![0u8; (block_end - block_start) as usize];
        file.seek(SeekFrom::Start(block_start))?;
        file.read_exact(&mut buf)?;
        if let Some(idx) = buf.iter().rposition(|&b| b == b'\n') {
            return Ok(block_start + idx as u64 + 1);
        }
        block_end = block_start;
    }
    Ok(0)
}

/// Offsets handed out always follow a newline; anything else means the
/// file was truncated and rewritten past the old offset
fn ends_line_at(file: &mut File, offset: u64) -> std::io::Result<bool> {
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset - 1))?;
    file.read_exact(&mut byte)?;
    Ok(byte[0] == b'\n')
}

fn parse_lines(bytes: &[u8]) -> Vec<MetricPoint> {
    bytes
        .split(|&b| b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .filter_map(|line| MetricPoint::from_json_line(&String::from_utf8_lossy(line)))
        .collect()
}
