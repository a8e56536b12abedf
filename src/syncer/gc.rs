//! Disk guard for the mirror tree.
//!
//! When the mirrored logs grow past a threshold the oldest files are
//! truncated to zero length. Files written recently are never touched.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use crate::core::errors::{DiagError, Result};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::syncer::cancel::CancelToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub scanned_files: usize,
    pub total_bytes: u64,
    /// `(path, bytes released)`, oldest first.
    pub truncated: Vec<(PathBuf, u64)>,
}

impl GcReport {
    pub fn released_bytes(&self) -> u64 {
        self.truncated.iter().map(|(_, bytes)| bytes).sum()
    }
}

struct FileStat {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

/// Regular files under `root`; symlinks are not followed. A missing root
/// yields nothing.
fn walk(root: &Path) -> Result<Vec<FileStat>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) if dir == root => return Err(DiagError::io(&dir, e)),
            Err(e) => {
                eprintln!("[DIAG-GC] skipping {}: {e}", dir.display());
                continue;
            }
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let Ok(meta) = fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                files.push(FileStat {
                    path: entry.path(),
                    len: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }
    Ok(files)
}

/// One pass using the wall clock.
pub fn collect(root: &Path, threshold_bytes: u64, protect_window: Duration) -> Result<GcReport> {
    collect_at(root, threshold_bytes, protect_window, SystemTime::now())
}

/// One pass as of `now`: if the tree exceeds `threshold_bytes`, truncate
/// the oldest files until the excess is released. Files modified within
/// `protect_window` of `now` are skipped.
pub fn collect_at(root: &Path, threshold_bytes: u64, protect_window: Duration, now: SystemTime) -> Result<GcReport> {
    let mut files = walk(root)?;
    let total_bytes: u64 = files.iter().map(|f| f.len).sum();
    let mut report = GcReport {
        scanned_files: files.len(),
        total_bytes,
        truncated: Vec::new(),
    };
    if total_bytes <= threshold_bytes {
        return Ok(report);
    }

    let protected_after = now.checked_sub(protect_window).unwrap_or(SystemTime::UNIX_EPOCH);
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let mut excess = total_bytes - threshold_bytes;
    for file in files {
        if excess == 0 {
            break;
        }
        if file.len == 0 || file.modified >= protected_after {
            continue;
        }
        match truncate(&file.path) {
            Ok(()) => {
                excess = excess.saturating_sub(file.len);
                report.truncated.push((file.path, file.len));
            }
            Err(e) => eprintln!("[DIAG-GC] {e}"),
        }
    }
    Ok(report)
}

fn truncate(path: &Path) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(0))
        .map_err(|e| DiagError::io(path, e))
}

// ──────────────────── worker ────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcSettings {
    pub root: PathBuf,
    pub threshold_bytes: u64,
    pub protect_window: Duration,
    pub interval: Duration,
}

/// Run [`collect`] every `interval` on a `diag-gc` thread until `token`
/// is cancelled. Each truncation is logged as `GcTruncated`.
pub fn spawn_worker(
    settings: GcSettings,
    token: CancelToken,
    logger: ActivityLoggerHandle,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("diag-gc".to_string())
        .spawn(move || {
            loop {
                match collect(&settings.root, settings.threshold_bytes, settings.protect_window) {
                    Ok(report) => {
                        for (path, bytes) in report.truncated {
                            logger.send(ActivityEvent::GcTruncated {
                                path: path.display().to_string(),
                                bytes,
                            });
                        }
                    }
                    Err(e) => logger.send(ActivityEvent::error(&e)),
                }
                if token.sleep(settings.interval) {
                    break;
                }
            }
        })
        .map_err(|source| DiagError::Runtime {
            details: format!("failed to spawn gc thread: {source}"),
        })
}
