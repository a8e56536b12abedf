//! Sync lanes: one named thread per [`SyncTask`], each running rsync on a
//! fixed interval until its generation is cancelled.
//!
//! Replacing the task set is all-or-nothing: the old generation is
//! cancelled and joined before any lane of the new one starts.

#![allow(missing_docs)]

use std::fs;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::SyncConfig;
use crate::core::errors::{DiagError, Result};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::syncer::cancel::{CancelSource, CancelToken};
use crate::syncer::topology::SyncTask;

/// How often a lane checks on its running child.
const CHILD_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneConfig {
    pub rsync_program: String,
    pub bwlimit: u64,
    pub interval: Duration,
    /// Time between SIGTERM and SIGKILL for a cancelled child.
    pub kill_grace: Duration,
}

impl LaneConfig {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            rsync_program: sync.rsync_program.clone(),
            bwlimit: sync.bwlimit,
            interval: Duration::from_secs(sync.interval_secs),
            kill_grace: Duration::from_millis(sync.kill_grace_ms),
        }
    }
}

/// `-avz --bwlimit=N --include=p… --exclude=* from to`
pub fn rsync_args(task: &SyncTask, bwlimit: u64) -> Vec<String> {
    let mut args = vec!["-avz".to_string(), format!("--bwlimit={bwlimit}")];
    args.extend(task.filters.iter().map(|p| format!("--include={p}")));
    args.push("--exclude=*".to_string());
    args.push(task.from.clone());
    args.push(task.to.to_string_lossy().into_owned());
    args
}

/// Why a lane thread returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneExit {
    Cancelled,
    Failed,
}

struct Generation {
    cancel: CancelSource,
    lanes: Vec<thread::JoinHandle<LaneExit>>,
}

pub struct TaskManager {
    config: LaneConfig,
    logger: ActivityLoggerHandle,
    generation: u64,
    current: Option<Generation>,
}

impl TaskManager {
    pub fn new(config: LaneConfig, logger: ActivityLoggerHandle) -> Self {
        Self {
            config,
            logger,
            generation: 0,
            current: None,
        }
    }

    /// Cancel and join every running lane, then start one lane per task.
    pub fn run_tasks(&mut self, tasks: Vec<SyncTask>) -> Result<()> {
        self.cancel_current();
        self.generation += 1;

        let mut next = Generation {
            cancel: CancelSource::new(),
            lanes: Vec::with_capacity(tasks.len()),
        };
        for (n, task) in tasks.into_iter().enumerate() {
            let token = next.cancel.token();
            let config = self.config.clone();
            let logger = self.logger.clone();
            let spawned = thread::Builder::new()
                .name(format!("diag-lane-{n}"))
                .spawn(move || lane_main(&task, &config, &token, &logger));
            match spawned {
                Ok(join) => next.lanes.push(join),
                Err(source) => {
                    self.current = Some(next);
                    return Err(DiagError::Runtime {
                        details: format!("failed to spawn sync lane {n}: {source}"),
                    });
                }
            }
        }
        self.current = Some(next);
        Ok(())
    }

    /// Cancel and join the current generation. Idempotent.
    pub fn stop(&mut self) {
        self.cancel_current();
    }

    /// Number of `run_tasks` calls so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lanes of the current generation that are still running.
    pub fn lane_count(&self) -> usize {
        self.current.as_ref().map_or(0, |current| {
            current.lanes.iter().filter(|lane| !lane.is_finished()).count()
        })
    }

    fn cancel_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        current.cancel.cancel();
        for lane in current.lanes {
            if lane.join().is_err() {
                eprintln!("[DIAG-SYNC] lane thread panicked");
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

// ──────────────────── lane ────────────────────

enum CopyRun {
    Completed,
    Cancelled,
}

fn lane_main(task: &SyncTask, config: &LaneConfig, token: &CancelToken, logger: &ActivityLoggerHandle) -> LaneExit {
    logger.send(ActivityEvent::LaneStarted {
        key: task.key.clone(),
        from: task.from.clone(),
        to: task.to.display().to_string(),
    });

    if let Err(source) = fs::create_dir_all(&task.to) {
        report_failure(task, &DiagError::io(&task.to, source), logger);
        return LaneExit::Failed;
    }

    loop {
        if token.is_cancelled() {
            break;
        }
        let started = Instant::now();
        match run_copy(task, config, token) {
            Ok(CopyRun::Completed) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                logger.send(ActivityEvent::CopyCompleted {
                    key: task.key.clone(),
                    duration_ms,
                });
            }
            Ok(CopyRun::Cancelled) => break,
            Err(e) => {
                report_failure(task, &e, logger);
                return LaneExit::Failed;
            }
        }
        if token.sleep(config.interval) {
            break;
        }
    }

    logger.send(ActivityEvent::LaneCancelled { key: task.key.clone() });
    LaneExit::Cancelled
}

fn report_failure(task: &SyncTask, err: &DiagError, logger: &ActivityLoggerHandle) {
    eprintln!("[DIAG-SYNC] lane {} stopped: {err}", task.key);
    logger.send(ActivityEvent::CopyFailed {
        key: task.key.clone(),
        code: err.code().to_string(),
        message: err.to_string(),
    });
}

fn run_copy(task: &SyncTask, config: &LaneConfig, token: &CancelToken) -> Result<CopyRun> {
    let mut child = Command::new(&config.rsync_program)
        .args(rsync_args(task, config.bwlimit))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| DiagError::CopyFailed {
            key: task.key.clone(),
            details: format!("cannot start {}: {e}", config.rsync_program),
        })?;

    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(CopyRun::Completed),
            Ok(Some(status)) => {
                return Err(DiagError::CopyFailed {
                    key: task.key.clone(),
                    details: format!("{} exited with {status}", config.rsync_program),
                });
            }
            Ok(None) => {
                if token.sleep(CHILD_POLL) {
                    terminate(&mut child, config.kill_grace);
                    return Ok(CopyRun::Cancelled);
                }
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DiagError::CopyFailed {
                    key: task.key.clone(),
                    details: format!("wait failed: {e}"),
                });
            }
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crossbeam_channel::Receiver;

    use super::*;

    fn fake_rsync(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-rsync.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Appends its arguments to `<last arg>/calls.log`.
    const RECORDING: &str = "for last; do :; done\necho \"$@\" >> \"$last/calls.log\"";

    fn task(root: &Path, key: &str) -> SyncTask {
        SyncTask {
            key: key.to_string(),
            from: format!("tidb@10.0.0.1:/deploy/{key}/log/"),
            to: root.join("mirror").join(key),
            filters: vec!["tidb*".to_string()],
        }
    }

    fn lane_config(program: String, interval_ms: u64) -> LaneConfig {
        LaneConfig {
            rsync_program: program,
            bwlimit: 77,
            interval: Duration::from_millis(interval_ms),
            kill_grace: Duration::from_millis(200),
        }
    }

    fn drain(rx: &Receiver<ActivityEvent>) -> Vec<ActivityEvent> {
        rx.try_iter().collect()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn calls(path: &Path) -> Vec<String> {
        fs::read_to_string(path.join("calls.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn args_follow_rsync_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = task(dir.path(), "k");
        t.filters.push("alertmanager*".to_string());
        let args = rsync_args(&t, 500);
        assert_eq!(args[0], "-avz");
        assert_eq!(args[1], "--bwlimit=500");
        assert_eq!(args[2], "--include=tidb*");
        assert_eq!(args[3], "--include=alertmanager*");
        assert_eq!(args[4], "--exclude=*");
        assert_eq!(args[5], t.from);
        assert_eq!(PathBuf::from(&args[6]), t.to);
    }

    #[test]
    fn lane_repeats_copy_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, rx) = ActivityLoggerHandle::capture();
        let program = fake_rsync(dir.path(), RECORDING);
        let mut manager = TaskManager::new(lane_config(program, 30), logger);
        let t = task(dir.path(), "tidb-4000");

        manager.run_tasks(vec![t.clone()]).unwrap();
        assert_eq!(manager.generation(), 1);
        assert!(wait_for(|| calls(&t.to).len() >= 2));
        assert_eq!(manager.lane_count(), 1);
        manager.stop();
        assert_eq!(manager.lane_count(), 0);

        let first = &calls(&t.to)[0];
        assert!(first.contains("--bwlimit=77"));
        assert!(first.contains("--include=tidb*"));
        assert!(first.contains("--exclude=*"));

        let events = drain(&rx);
        assert!(matches!(events.first(), Some(ActivityEvent::LaneStarted { key, .. }) if key == "tidb-4000"));
        assert!(events.iter().any(|e| matches!(e, ActivityEvent::CopyCompleted { .. })));
        assert!(matches!(events.last(), Some(ActivityEvent::LaneCancelled { .. })));
    }

    #[test]
    fn failing_copy_ends_lane_with_copy_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, rx) = ActivityLoggerHandle::capture();
        let program = fake_rsync(dir.path(), "exit 23");
        let mut manager = TaskManager::new(lane_config(program, 30), logger);

        manager.run_tasks(vec![task(dir.path(), "pd-2379")]).unwrap();
        assert!(wait_for(|| manager.lane_count() == 0));
        manager.stop();

        let events = drain(&rx);
        let failed = events
            .iter()
            .find_map(|e| match e {
                ActivityEvent::CopyFailed { key, code, message } => Some((key, code, message)),
                _ => None,
            })
            .unwrap();
        assert_eq!(failed.0, "pd-2379");
        assert_eq!(failed.1, "DIAG-2301");
        assert!(failed.2.contains("exited"));
        assert!(!events.iter().any(|e| matches!(e, ActivityEvent::LaneCancelled { .. })));
    }

    #[test]
    fn missing_program_reports_copy_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, rx) = ActivityLoggerHandle::capture();
        let missing = dir.path().join("no-such-rsync").to_string_lossy().into_owned();
        let mut manager = TaskManager::new(lane_config(missing, 30), logger);

        manager.run_tasks(vec![task(dir.path(), "tikv-20160")]).unwrap();
        assert!(wait_for(|| manager.lane_count() == 0));
        assert!(drain(&rx).iter().any(|e| matches!(e, ActivityEvent::CopyFailed { .. })));
    }

    #[test]
    fn stop_terminates_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, rx) = ActivityLoggerHandle::capture();
        let program = fake_rsync(dir.path(), "exec sleep 30");
        let mut manager = TaskManager::new(lane_config(program, 30), logger);

        manager.run_tasks(vec![task(dir.path(), "a"), task(dir.path(), "b")]).unwrap();
        thread::sleep(Duration::from_millis(200));
        let start = Instant::now();
        manager.stop();
        assert!(start.elapsed() < Duration::from_secs(5));

        let cancelled = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, ActivityEvent::LaneCancelled { .. }))
            .count();
        assert_eq!(cancelled, 2);
    }

    #[test]
    fn run_tasks_replaces_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, rx) = ActivityLoggerHandle::capture();
        let program = fake_rsync(dir.path(), RECORDING);
        let mut manager = TaskManager::new(lane_config(program, 10_000), logger);
        let old = task(dir.path(), "old");
        let new = task(dir.path(), "new");

        manager.run_tasks(vec![old.clone()]).unwrap();
        assert!(wait_for(|| !calls(&old.to).is_empty()));
        manager.run_tasks(vec![new.clone()]).unwrap();
        assert_eq!(manager.generation(), 2);

        let events = drain(&rx);
        assert!(events.iter().any(|e| matches!(e, ActivityEvent::LaneCancelled { key } if key == "old")));
        assert!(wait_for(|| !calls(&new.to).is_empty()));
        assert_eq!(manager.lane_count(), 1);
    }

    #[test]
    fn empty_task_set_runs_nothing() {
        let (logger, _rx) = ActivityLoggerHandle::capture();
        let mut manager = TaskManager::new(lane_config("rsync".to_string(), 30), logger);
        manager.run_tasks(Vec::new()).unwrap();
        assert_eq!(manager.lane_count(), 0);
        assert_eq!(manager.generation(), 1);
    }
}
