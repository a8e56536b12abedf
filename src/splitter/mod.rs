//! Time-window slicing of a collected log tree into a mirrored tree.
//!
//! Files whose base name contains a known family are copied line by line,
//! keeping only the records whose head falls in `(begin, end]`. Everything
//! else is left out of the mirror.

#![allow(missing_docs)]

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{DiagError, Result};
use crate::logs::item::{SLOW_QUERY_FILE_NAME, Timestamp};
use crate::logs::parser::{HeadParser, ParserSet, SlowQueryParser};

/// Log families the splitter knows how to cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    SlowQuery,
    TiDB,
    TiKV,
    PD,
}

impl Family {
    /// Match by substring of the base name; slow-query first since its name
    /// also contains `tidb`.
    pub fn detect(file_name: &str) -> Option<Self> {
        if file_name.contains(SLOW_QUERY_FILE_NAME) {
            Some(Self::SlowQuery)
        } else if file_name.contains("tidb.log") {
            Some(Self::TiDB)
        } else if file_name.contains("tikv.log") {
            Some(Self::TiKV)
        } else if file_name.contains("pd.log") {
            Some(Self::PD)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitFile {
    /// Path relative to the source root.
    pub path: PathBuf,
    pub family: Family,
    pub lines: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SplitReport {
    pub files: Vec<SplitFile>,
    pub skipped: Vec<PathBuf>,
}

impl SplitReport {
    pub fn total_lines(&self) -> u64 {
        self.files.iter().map(|f| f.lines).sum()
    }
}

/// Mirror `src` under `dst`, copying only windowed lines of known families.
pub fn split_dir(src: &Path, dst: &Path, begin: Timestamp, end: Timestamp) -> Result<SplitReport> {
    let mut report = SplitReport::default();
    walk(src, dst, Path::new(""), &begin, &end, &mut report)?;
    Ok(report)
}

fn walk(
    src: &Path,
    dst: &Path,
    rel: &Path,
    begin: &Timestamp,
    end: &Timestamp,
    report: &mut SplitReport,
) -> Result<()> {
    // The root may itself be a link; nothing below it is followed.
    let meta = if rel.as_os_str().is_empty() {
        fs::metadata(src)
    } else {
        fs::symlink_metadata(src)
    }
    .map_err(|e| DiagError::io(src, e))?;
    if meta.file_type().is_symlink() {
        report.skipped.push(rel.to_path_buf());
        return Ok(());
    }
    if meta.is_dir() {
        fs::create_dir_all(dst).map_err(|e| DiagError::io(dst, e))?;
        let mut entries = fs::read_dir(src)
            .map_err(|e| DiagError::io(src, e))?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| DiagError::io(src, e))?;
        entries.sort_by_key(fs::DirEntry::file_name);
        for entry in entries {
            let name = entry.file_name();
            walk(
                &src.join(&name),
                &dst.join(&name),
                &rel.join(&name),
                begin,
                end,
                report,
            )?;
        }
        return Ok(());
    }
    if !meta.is_file() {
        return Ok(());
    }

    let base = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(family) = Family::detect(&base) else {
        report.skipped.push(rel.to_path_buf());
        return Ok(());
    };

    let from = File::open(src).map_err(|e| DiagError::io(src, e))?;
    let to = File::create(dst).map_err(|e| DiagError::io(dst, e))?;
    let mut reader = BufReader::new(from);
    let mut writer = BufWriter::new(to);
    let lines = match family {
        Family::SlowQuery => split_slow_query(&mut reader, &mut writer, begin, end),
        _ => split_records(&mut reader, &mut writer, begin, end),
    }
    .map_err(|e| DiagError::io(src, e))?;
    writer.flush().map_err(|e| DiagError::io(dst, e))?;

    report.files.push(SplitFile {
        path: rel.to_path_buf(),
        family,
        lines,
    });
    Ok(())
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(true)
}

fn write_line<W: Write>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line)?;
    writer.write_all(b"\n")
}

/// Head-delimited formats: a head decides whether it and its continuation
/// lines are copied; the first head past `end` stops the copy.
pub fn split_records<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    begin: &Timestamp,
    end: &Timestamp,
) -> std::io::Result<u64> {
    let mut parsers = ParserSet::standard();
    let mut in_window = false;
    let mut copied = 0;
    let mut line = Vec::new();
    while read_line(reader, &mut line)? {
        if let Some((t, _)) = parsers.parse(&line) {
            if t > *end {
                break;
            }
            in_window = t > *begin;
        }
        if in_window {
            write_line(writer, &line)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlowState {
    Searching,
    Writing,
    Skipping,
}

/// Slow-query records: `# Time:` opens a record, the first non-`#` line
/// (the SQL) closes it.
pub fn split_slow_query<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    begin: &Timestamp,
    end: &Timestamp,
) -> std::io::Result<u64> {
    let parser = SlowQueryParser;
    let mut state = SlowState::Searching;
    let mut copied = 0;
    let mut line = Vec::new();
    while read_line(reader, &mut line)? {
        match state {
            SlowState::Searching => {
                let Some(t) = parser.parse_head(&line).time else {
                    continue;
                };
                if t > *end {
                    break;
                }
                if t > *begin {
                    state = SlowState::Writing;
                    write_line(writer, &line)?;
                    copied += 1;
                } else {
                    state = SlowState::Skipping;
                }
            }
            SlowState::Writing => {
                write_line(writer, &line)?;
                copied += 1;
            }
            SlowState::Skipping => {}
        }
        if line.first().is_some_and(|b| *b != b'#') {
            state = SlowState::Searching;
        }
    }
    Ok(copied)
}
