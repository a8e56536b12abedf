//! Time-windowed record iterator over one log file.
//!
//! Opening an iterator binary-searches the file by byte offset for the first
//! head strictly after `begin`, falling back to a linear "carpet" scan once
//! the range is below [`SEEK_THRESHOLD`]. Records are then produced lazily
//! until a head past `end` or EOF.

#![allow(missing_docs)]

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::core::errors::{DiagError, Result};
use crate::logs::descriptor::FileDescriptor;
use crate::logs::item::{Level, LogItem, LogKind, Timestamp};
use crate::logs::parser::ParserSet;

/// Below this many bytes the seek scans linearly. Must be at least the
/// largest record a file can hold.
pub const SEEK_THRESHOLD: u64 = 1024 * 1024;

const READ_BUFFER: usize = 64 * 1024;

/// A peekable, closable stream of records in non-decreasing time order.
pub trait LogStream {
    /// Next record without advancing. `None` at the end of the stream or
    /// when an error is waiting to be surfaced.
    fn peek(&self) -> Option<&LogItem>;

    /// `Ok(None)` once exhausted. A latched error is returned exactly once.
    fn next_item(&mut self) -> Result<Option<LogItem>>;

    /// Release underlying resources. Idempotent.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekOutcome {
    /// A head after the target was reached. `current` may still be empty
    /// when that head lies past `end`.
    Found,
    Eof,
}

#[derive(Debug)]
pub struct FileIterator {
    path: PathBuf,
    host: String,
    port: String,
    component: String,
    filename: String,
    kind: LogKind,
    reader: Option<BufReader<File>>,
    parsers: ParserSet,
    begin: Timestamp,
    end: Timestamp,
    threshold: u64,
    current: Option<LogItem>,
    lookahead: Option<LogItem>,
    latched: Option<DiagError>,
    line: Vec<u8>,
}

impl FileIterator {
    /// Open with every known head shape.
    pub fn open(descriptor: &FileDescriptor, begin: Timestamp, end: Timestamp) -> Result<Self> {
        Self::with_parsers(descriptor, begin, end, ParserSet::standard())
    }

    pub fn with_parsers(
        descriptor: &FileDescriptor,
        begin: Timestamp,
        end: Timestamp,
        parsers: ParserSet,
    ) -> Result<Self> {
        Self::open_with_threshold(descriptor, begin, end, parsers, SEEK_THRESHOLD)
    }

    pub(crate) fn open_with_threshold(
        descriptor: &FileDescriptor,
        begin: Timestamp,
        end: Timestamp,
        parsers: ParserSet,
        threshold: u64,
    ) -> Result<Self> {
        let (component, port) = descriptor.parse_folder_name()?;
        let kind = LogKind::classify(&component, &descriptor.filename);
        if kind == LogKind::Invalid {
            return Err(DiagError::UnknownComponent { component });
        }

        let path = descriptor.path();
        let file = File::open(&path).map_err(|e| DiagError::io(&path, e))?;
        let size = file.metadata().map_err(|e| DiagError::io(&path, e))?.len();

        let mut iter = Self {
            path,
            host: descriptor.host.clone(),
            port,
            component,
            filename: descriptor.filename.clone(),
            kind,
            reader: Some(BufReader::with_capacity(READ_BUFFER, file)),
            parsers,
            begin,
            end,
            threshold: threshold.max(1),
            current: None,
            lookahead: None,
            latched: None,
            line: Vec::new(),
        };

        let target = iter.begin;
        match iter.seek(0, size, &target)? {
            SeekOutcome::Found if iter.current.is_some() => iter.assemble(),
            _ => iter.finish(),
        }
        Ok(iter)
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window(&self) -> (Timestamp, Timestamp) {
        (self.begin, self.end)
    }

    /// Whether the file handle is still held.
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    // ──────────────────── seek ────────────────────

    fn seek(&mut self, lo: u64, hi: u64, target: &Timestamp) -> Result<SeekOutcome> {
        if hi.saturating_sub(lo) < self.threshold {
            return self.carpet(lo, hi, target);
        }
        let mid = lo + (hi - lo) / 2;
        let window_end = mid.saturating_add(self.threshold).min(hi);
        match self.seek(mid, window_end, target)? {
            SeekOutcome::Eof => self.seek(mid, hi, target),
            SeekOutcome::Found => match self.seek(lo, mid, target)? {
                SeekOutcome::Found => Ok(SeekOutcome::Found),
                SeekOutcome::Eof => self.carpet(mid, window_end, target),
            },
        }
    }

    /// Linear scan of the heads starting in `[lo, hi)` for the first one
    /// after `target`.
    fn carpet(&mut self, lo: u64, hi: u64, target: &Timestamp) -> Result<SeekOutcome> {
        self.current = None;
        self.lookahead = None;

        let mut partial = lo > 0 && !self.starts_line(lo)?;
        self.reader_mut()?
            .seek(SeekFrom::Start(lo))
            .map_err(|e| DiagError::io(&self.path, e))?;

        let mut pos = lo;
        while pos < hi {
            let n = self.read_line()?;
            if n == 0 {
                return Ok(SeekOutcome::Eof);
            }
            pos += n as u64;
            if std::mem::take(&mut partial) {
                continue;
            }
            let Some((time, level)) = self.parsers.parse(&self.line) else {
                continue;
            };
            if time > *target {
                if time <= self.end {
                    self.current = Some(self.make_item(time, level));
                }
                return Ok(SeekOutcome::Found);
            }
        }
        Ok(SeekOutcome::Eof)
    }

    fn starts_line(&mut self, pos: u64) -> Result<bool> {
        let reader = self.reader_mut()?;
        let mut byte = [0_u8; 1];
        let read = reader
            .seek(SeekFrom::Start(pos - 1))
            .and_then(|_| reader.read_exact(&mut byte));
        read.map_err(|e| DiagError::io(&self.path, e))?;
        Ok(byte[0] == b'\n')
    }

    // ──────────────────── reading ────────────────────

    fn reader_mut(&mut self) -> Result<&mut BufReader<File>> {
        match self.reader.as_mut() {
            Some(reader) => Ok(reader),
            None => Err(DiagError::io(
                &self.path,
                std::io::Error::other("iterator is closed"),
            )),
        }
    }

    /// Read one line into `self.line` without its terminator. Returns the
    /// number of bytes consumed from the file; 0 at EOF.
    fn read_line(&mut self) -> Result<usize> {
        let mut buf = std::mem::take(&mut self.line);
        buf.clear();
        let read = self.reader_mut()?.read_until(b'\n', &mut buf);
        let n = read.map_err(|e| DiagError::io(&self.path, e))?;
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        self.line = buf;
        Ok(n)
    }

    fn make_item(&self, time: Timestamp, level: Level) -> LogItem {
        LogItem {
            host: self.host.clone(),
            port: self.port.clone(),
            component: self.component.clone(),
            file: self.filename.clone(),
            time,
            level,
            kind: self.kind,
            content: self.line.clone(),
        }
    }

    /// Append continuation lines to `current` until the next head (kept as
    /// lookahead), a head past `end`, EOF, or an error (latched).
    fn assemble(&mut self) {
        loop {
            match self.read_line() {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    self.latched = Some(err);
                    break;
                }
            }
            if let Some((time, level)) = self.parsers.parse(&self.line) {
                if time <= self.end {
                    self.lookahead = Some(self.make_item(time, level));
                    return;
                }
                break;
            }
            let Some(current) = self.current.as_mut() else {
                break;
            };
            if let Err(err) = current.append_content(&self.line) {
                self.latched = Some(err);
                break;
            }
        }
        self.finish();
    }

    /// Nothing more will be read from the file.
    fn finish(&mut self) {
        self.lookahead = None;
        self.reader = None;
        self.line = Vec::new();
    }
}

impl LogStream for FileIterator {
    fn peek(&self) -> Option<&LogItem> {
        self.current.as_ref()
    }

    fn next_item(&mut self) -> Result<Option<LogItem>> {
        let Some(item) = self.current.take() else {
            return match self.latched.take() {
                Some(err) => Err(err),
                None => Ok(None),
            };
        };
        if let Some(next) = self.lookahead.take() {
            self.current = Some(next);
            self.assemble();
        }
        Ok(Some(item))
    }

    fn close(&mut self) {
        self.current = None;
        self.latched = None;
        self.finish();
    }
}

impl Iterator for FileIterator {
    type Item = Result<LogItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}
