//! Line-delimited JSON activity log.
//!
//! Every entry is serialized in full and handed to the file with a single
//! `write_all`, so a concurrent `tail -f` never sees half a record.
//!
//! When the log file cannot be written the writer steps down, in order:
//! primary path, fallback path, stderr (`[DIAG-JSONL]` prefix), discard.
//! Logging never takes the supervisor down.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DiagError, Result};

const WRITE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Activity kinds recorded by the toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SyncStart,
    SyncStop,
    TopologyReload,
    LaneStart,
    CopyComplete,
    CopyFail,
    LaneCancel,
    GcTruncate,
    AnalysisComplete,
    TaskFail,
    Error,
}

impl EventType {
    /// Same text as the serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncStart => "sync_start",
            Self::SyncStop => "sync_stop",
            Self::TopologyReload => "topology_reload",
            Self::LaneStart => "lane_start",
            Self::CopyComplete => "copy_complete",
            Self::CopyFail => "copy_fail",
            Self::LaneCancel => "lane_cancel",
            Self::GcTruncate => "gc_truncate",
            Self::AnalysisComplete => "analysis_complete",
            Self::TaskFail => "task_fail",
            Self::Error => "error",
        }
    }
}

/// One JSONL line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC3339 UTC with milliseconds.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Sync task key or analysis task name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// `DIAG-xxxx` code of a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: utc_now(),
            event,
            severity,
            key: None,
            path: None,
            bytes: None,
            count: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// Attach a failure taken from an error value.
    pub fn failed(mut self, err: &DiagError) -> Self {
        self.ok = Some(false);
        self.error_code = Some(err.code().to_string());
        self.error_message = Some(err.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl Sink {
    const fn label(self) -> &'static str {
        match self {
            Self::Primary => "normal",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Tried when `path` cannot be opened or written.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would grow past this.
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: crate::core::paths::default_jsonl_path(),
            fallback_path: None,
            max_size_bytes: 64 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

/// Append-only writer with size rotation and the degradation chain above.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    sink: Sink,
    bytes_written: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            sink: Sink::Discard,
            bytes_written: 0,
            last_sync: Instant::now(),
        };
        if !writer.attach(Sink::Primary) && !writer.attach(Sink::Fallback) {
            writer.sink = Sink::Stderr;
            let _ = writeln!(io::stderr(), "[DIAG-JSONL] no writable log file, using stderr");
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => {
                let _ = writeln!(io::stderr(), "[DIAG-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
            let _ = file.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    /// `normal`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        self.sink.label()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    // ──────────────────── internals ────────────────────

    fn sink_path(&self, sink: Sink) -> Option<&Path> {
        match sink {
            Sink::Primary => Some(&self.config.path),
            Sink::Fallback => self.config.fallback_path.as_deref(),
            Sink::Stderr | Sink::Discard => None,
        }
    }

    /// Open `sink`'s file and make it current. False if it has none or
    /// cannot be opened.
    fn attach(&mut self, sink: Sink) -> bool {
        let Some(path) = self.sink_path(sink) else {
            return false;
        };
        match open_append(path) {
            Ok((file, size)) => {
                if sink == Sink::Fallback {
                    let _ = writeln!(
                        io::stderr(),
                        "[DIAG-JSONL] primary path failed, using fallback: {}",
                        path.display()
                    );
                }
                self.file = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
                self.sink = sink;
                self.bytes_written = size;
                true
            }
            Err(_) => false,
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.file.is_some() && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }

        match self.sink {
            Sink::Primary | Sink::Fallback => {
                let written = self
                    .file
                    .as_mut()
                    .is_some_and(|file| file.write_all(line.as_bytes()).is_ok());
                if !written {
                    self.step_down();
                    self.write_line(line);
                    return;
                }
                self.bytes_written += len;
                if self.last_sync.elapsed() >= Duration::from_secs(self.config.fsync_interval_secs) {
                    self.fsync();
                }
            }
            Sink::Stderr => {
                let _ = write!(io::stderr(), "[DIAG-JSONL] {line}");
            }
            Sink::Discard => {}
        }
    }

    fn step_down(&mut self) {
        self.file = None;
        match self.sink {
            Sink::Primary => {
                if !self.attach(Sink::Fallback) {
                    self.sink = Sink::Stderr;
                    let _ = writeln!(io::stderr(), "[DIAG-JSONL] log file unwritable, using stderr");
                }
            }
            Sink::Fallback => {
                self.sink = Sink::Stderr;
                let _ = writeln!(io::stderr(), "[DIAG-JSONL] fallback write failed, using stderr");
            }
            Sink::Stderr => self.sink = Sink::Discard,
            Sink::Discard => {}
        }
    }

    /// `log` → `log.1` → … → `log.N`; the oldest is dropped.
    fn rotate(&mut self) {
        self.flush();
        self.file = None;
        let current = self.sink;
        let Some(base) = self.sink_path(current).map(Path::to_path_buf) else {
            return;
        };

        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        let _ = fs::rename(&base, rotated_name(&base, 1));

        if !self.attach(current) {
            self.sink = current;
            self.step_down();
        }
    }
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| DiagError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DiagError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
