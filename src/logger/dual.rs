//! Activity logger thread: JSONL always, SQLite when enabled.
//!
//! A dedicated thread owns both writers. Producers hold an
//! [`ActivityLoggerHandle`] and enqueue [`ActivityEvent`]s with `try_send`
//! on a bounded crossbeam channel, so a slow disk never stalls a sync lane.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::Config;
use crate::core::errors::{DiagError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::{ActivityRow, SqliteLogger};

const CHANNEL_CAPACITY: usize = 1024;
/// Consecutive SQLite failures before the database is abandoned.
#[cfg(feature = "sqlite")]
const SQLITE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    SupervisorStarted {
        version: String,
        config_hash: String,
    },
    SupervisorStopped {
        reason: String,
        uptime_secs: u64,
    },
    TopologyReloaded {
        generation: u64,
        tasks: usize,
    },
    LaneStarted {
        key: String,
        from: String,
        to: String,
    },
    CopyCompleted {
        key: String,
        duration_ms: u64,
    },
    CopyFailed {
        key: String,
        code: String,
        message: String,
    },
    LaneCancelled {
        key: String,
    },
    GcTruncated {
        path: String,
        bytes: u64,
    },
    AnalysisCompleted {
        inspection: String,
        tasks: usize,
        failures: usize,
    },
    TaskFailed {
        task: String,
        code: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Stops the logger thread after flushing.
    Shutdown,
}

impl ActivityEvent {
    /// Build an `Error` event from a crate error.
    pub fn error(err: &DiagError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Cloneable producer side of the logger channel.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Enqueue without blocking. A full channel drops the event and bumps
    /// the dropped counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only while the
    /// channel is full.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// A handle plus the raw receiving end, with no logger thread behind it.
    #[cfg(test)]
    pub(crate) fn capture() -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let handle = Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }
}

pub struct DualLoggerConfig {
    /// `None` disables SQLite.
    pub sqlite_path: Option<PathBuf>,
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl DualLoggerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sqlite_path: Some(config.paths.sqlite_db.clone()),
            jsonl_config: JsonlConfig {
                path: config.paths.jsonl_log.clone(),
                fallback_path: config.paths.jsonl_fallback.clone(),
                ..JsonlConfig::default()
            },
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread. It runs until [`ActivityLoggerHandle::shutdown`]
/// or until every handle is dropped.
pub fn spawn_logger(config: DualLoggerConfig) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("diag-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.sqlite_path, config.jsonl_config, &dropped))
        .map_err(|source| DiagError::Runtime {
            details: format!("failed to spawn logger thread: {source}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    sqlite_path: Option<PathBuf>,
    jsonl_config: JsonlConfig,
    dropped: &AtomicU64,
) {
    #[cfg(feature = "sqlite")]
    let mut sqlite = sqlite_path.and_then(|p| match SqliteLogger::open(&p) {
        Ok(db) => Some(db),
        Err(e) => {
            eprintln!("[DIAG-DUAL] failed to open SQLite at {}: {e}", p.display());
            None
        }
    });
    #[cfg(not(feature = "sqlite"))]
    let _ = sqlite_path;
    #[cfg(feature = "sqlite")]
    let mut sqlite_failures: u32 = 0;

    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.count = Some(lost);
            warn.details = Some(format!("{lost} activity events dropped under back-pressure"));
            jsonl.write_entry(&warn);
        }

        let Some(entry) = to_log_entry(&event) else {
            break;
        };
        jsonl.write_entry(&entry);

        #[cfg(feature = "sqlite")]
        if let Some(db) = &sqlite {
            if db.log_activity(&to_activity_row(&entry)).is_ok() {
                sqlite_failures = 0;
            } else {
                sqlite_failures += 1;
                if sqlite_failures >= SQLITE_FAILURE_LIMIT {
                    eprintln!("[DIAG-DUAL] SQLite write failed {sqlite_failures} times, disabling");
                    sqlite = None;
                }
            }
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

/// `None` for the shutdown sentinel.
fn to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let entry = match event {
        ActivityEvent::SupervisorStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::SyncStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::SupervisorStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::SyncStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::TopologyReloaded { generation, tasks } => {
            let mut e = LogEntry::new(EventType::TopologyReload, Severity::Info);
            e.count = Some(*tasks as u64);
            e.details = Some(format!("generation={generation}"));
            e
        }
        ActivityEvent::LaneStarted { key, from, to } => {
            let mut e = LogEntry::new(EventType::LaneStart, Severity::Info);
            e.key = Some(key.clone());
            e.path = Some(to.clone());
            e.details = Some(format!("from={from}"));
            e
        }
        ActivityEvent::CopyCompleted { key, duration_ms } => {
            let mut e = LogEntry::new(EventType::CopyComplete, Severity::Info);
            e.key = Some(key.clone());
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::CopyFailed { key, code, message } => {
            let mut e = LogEntry::new(EventType::CopyFail, Severity::Warning);
            e.key = Some(key.clone());
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::LaneCancelled { key } => {
            let mut e = LogEntry::new(EventType::LaneCancel, Severity::Info);
            e.key = Some(key.clone());
            e
        }
        ActivityEvent::GcTruncated { path, bytes } => {
            let mut e = LogEntry::new(EventType::GcTruncate, Severity::Warning);
            e.path = Some(path.clone());
            e.bytes = Some(*bytes);
            e.ok = Some(true);
            e
        }
        ActivityEvent::AnalysisCompleted {
            inspection,
            tasks,
            failures,
        } => {
            let mut e = LogEntry::new(EventType::AnalysisComplete, Severity::Info);
            e.key = Some(inspection.clone());
            e.count = Some(*tasks as u64);
            e.ok = Some(*failures == 0);
            e.details = Some(format!("failures={failures}"));
            e
        }
        ActivityEvent::TaskFailed {
            task,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::TaskFail, Severity::Warning);
            e.key = Some(task.clone());
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}

#[cfg(feature = "sqlite")]
fn to_activity_row(entry: &LogEntry) -> ActivityRow {
    ActivityRow {
        timestamp: entry.ts.clone(),
        event_type: entry.event.as_str().to_string(),
        severity: entry.severity.as_str().to_string(),
        key: entry.key.clone(),
        path: entry.path.clone(),
        bytes: entry.bytes.map(|b| i64::try_from(b).unwrap_or(i64::MAX)),
        count: entry.count.map(|c| i64::try_from(c).unwrap_or(i64::MAX)),
        duration_ms: entry.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)),
        success: i32::from(entry.ok.unwrap_or(true)),
        error_code: entry.error_code.clone(),
        error_message: entry.error_message.clone(),
        details: entry.details.clone(),
    }
}
