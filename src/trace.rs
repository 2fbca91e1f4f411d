//! Workload trace input.
//!
//! A trace is ASCII, one record per line:
//! `arrival_ns device lsn size opcode`, with opcode 1 = read, 0 = write.
//! Negative fields are fatal; an all-zero line is assumed to be a stray blank
//! record and only produces a warning.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Write = 0,
    Read = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub time: i64,
    pub device: u32,
    pub lsn: u32,
    pub size: u32,
    pub operation: Op,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot open trace file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("trace line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("trace read failed: {0}")]
    Io(#[from] std::io::Error),
}

enum Source {
    File { reader: BufReader<File>, line: usize },
    Memory { records: Vec<TraceRecord>, pos: usize },
}

/// Pull-based trace reader with single-record lookahead.
///
/// The scheduler admits a record only once virtual time has caught up with its
/// arrival; `peek` lets it inspect the next arrival without consuming it (the
/// equivalent of the original file-pointer rollback).
pub struct TraceReader {
    source: Source,
    peeked: Option<TraceRecord>,
}

impl TraceReader {
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            source: Source::File {
                reader: BufReader::new(file),
                line: 0,
            },
            peeked: None,
        })
    }

    /// Reader over pre-built records; used by the RAID layer to feed each
    /// member disk its slice of the striped workload.
    pub fn from_records(records: Vec<TraceRecord>) -> Self {
        Self {
            source: Source::Memory { records, pos: 0 },
            peeked: None,
        }
    }

    /// Restart from the first record. The pre-process pass consumes the trace
    /// once before the simulation proper replays it.
    pub fn rewind(&mut self) -> Result<(), TraceError> {
        self.peeked = None;
        match &mut self.source {
            Source::Memory { pos, .. } => *pos = 0,
            Source::File { reader, line } => {
                use std::io::Seek;
                reader.seek(std::io::SeekFrom::Start(0))?;
                *line = 0;
            }
        }
        Ok(())
    }

    pub fn peek(&mut self) -> Result<Option<TraceRecord>, TraceError> {
        if self.peeked.is_none() {
            self.peeked = self.pull()?;
        }
        Ok(self.peeked)
    }

    pub fn next(&mut self) -> Result<Option<TraceRecord>, TraceError> {
        if let Some(rec) = self.peeked.take() {
            return Ok(Some(rec));
        }
        self.pull()
    }

    fn pull(&mut self) -> Result<Option<TraceRecord>, TraceError> {
        match &mut self.source {
            Source::Memory { records, pos } => {
                let rec = records.get(*pos).copied();
                *pos += 1;
                Ok(rec)
            }
            Source::File { reader, line } => {
                let mut buf = String::new();
                loop {
                    buf.clear();
                    *line += 1;
                    if reader.read_line(&mut buf)? == 0 {
                        return Ok(None);
                    }
                    if buf.trim().is_empty() {
                        continue;
                    }
                    return parse_line(buf.trim(), *line).map(Some);
                }
            }
        }
    }
}

fn parse_line(text: &str, line: usize) -> Result<TraceRecord, TraceError> {
    let mut fields = text.split_whitespace();
    let mut next_i64 = |name: &str| -> Result<i64, TraceError> {
        let raw = fields.next().ok_or_else(|| TraceError::Malformed {
            line,
            reason: format!("missing {name}"),
        })?;
        raw.parse().map_err(|_| TraceError::Malformed {
            line,
            reason: format!("bad {name}: {raw}"),
        })
    };

    let time = next_i64("arrival")?;
    let device = next_i64("device")?;
    let lsn = next_i64("lsn")?;
    let size = next_i64("size")?;
    let ope = next_i64("opcode")?;

    if time < 0 || device < 0 || lsn < 0 || size < 0 || ope < 0 {
        return Err(TraceError::Malformed {
            line,
            reason: format!("negative field: {time} {device} {lsn} {size} {ope}"),
        });
    }
    if time == 0 && device == 0 && lsn == 0 && size == 0 && ope == 0 {
        log::warn!("trace line {line}: all-zero record, probably a blank line");
    }
    let operation = match ope {
        0 => Op::Write,
        1 => Op::Read,
        other => {
            return Err(TraceError::Malformed {
                line,
                reason: format!("bad opcode {other}"),
            })
        }
    };

    Ok(TraceRecord {
        time,
        device: device as u32,
        lsn: lsn as u32,
        size: size as u32,
        operation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_records_and_peeks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 0 0 4 0\n1000 0 0 4 1").unwrap();
        let mut reader = TraceReader::open(file.path()).unwrap();

        let first = reader.peek().unwrap().unwrap();
        assert_eq!(first.time, 0);
        assert_eq!(first.operation, Op::Write);
        // Peeking twice returns the same record.
        assert_eq!(reader.peek().unwrap().unwrap(), first);
        assert_eq!(reader.next().unwrap().unwrap(), first);

        let second = reader.next().unwrap().unwrap();
        assert_eq!(second.time, 1000);
        assert_eq!(second.operation, Op::Read);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn negative_fields_are_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0 0 -5 4 0").unwrap();
        let mut reader = TraceReader::open(file.path()).unwrap();
        assert!(reader.next().is_err());
    }

    #[test]
    fn skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\n\n5 0 8 4 0\n").unwrap();
        let mut reader = TraceReader::open(file.path()).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().time, 5);
        assert!(reader.next().unwrap().is_none());
    }
}
