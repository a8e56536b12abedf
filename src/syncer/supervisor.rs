//! Long-running log sync: the body of `cdiag sync`.
//!
//! The supervisor thread owns the [`TaskManager`]. A [`Watcher`] thread
//! and SIGHUP both request a reload; a reload rebuilds the full task set
//! from the topology directory and swaps in a new lane generation.

#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};

use crate::core::config::Config;
use crate::core::errors::{DiagError, Result};
use crate::daemon::signals::SignalHandler;
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::syncer::cancel::CancelSource;
use crate::syncer::gc::{self, GcSettings};
use crate::syncer::task_manager::{LaneConfig, TaskManager};
use crate::syncer::topology::{self, SyncTask};
use crate::syncer::watcher::{WatchEvent, Watcher};

/// Upper bound on how long a shutdown request goes unnoticed.
const TICK: Duration = Duration::from_millis(200);
const WATCH_CHANNEL_CAP: usize = 16;
/// Files younger than this many sync intervals are never truncated by gc.
const GC_PROTECT_INTERVALS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub topo_dir: PathBuf,
    pub target_dir: PathBuf,
    pub lane: LaneConfig,
    /// Settle window of the topology watcher.
    pub watch_settle: Duration,
    /// `None` disables the disk guard.
    pub gc: Option<GcSettings>,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        let lane = LaneConfig::from_config(&config.sync);
        let gc = config.gc.enabled.then(|| GcSettings {
            root: config.sync.target_dir.clone(),
            threshold_bytes: config.gc.threshold_gib.saturating_mul(1 << 30),
            protect_window: lane.interval.saturating_mul(GC_PROTECT_INTERVALS),
            interval: Duration::from_secs(config.gc.interval_secs.max(1)),
        });
        Self {
            topo_dir: config.sync.topo_dir.clone(),
            target_dir: config.sync.target_dir.clone(),
            lane,
            watch_settle: Duration::from_millis(config.sync.watch_settle_ms),
            gc,
        }
    }

    /// The task set a reload would start right now.
    pub fn plan(&self) -> Result<Vec<SyncTask>> {
        topology::load_tasks(&self.topo_dir, &self.target_dir)
    }
}

pub struct Supervisor {
    options: SupervisorOptions,
    config_hash: String,
    signals: SignalHandler,
    logger: ActivityLoggerHandle,
    manager: TaskManager,
}

impl Supervisor {
    pub fn new(
        options: SupervisorOptions,
        config_hash: String,
        signals: SignalHandler,
        logger: ActivityLoggerHandle,
    ) -> Self {
        let manager = TaskManager::new(options.lane.clone(), logger.clone());
        Self {
            options,
            config_hash,
            signals,
            logger,
            manager,
        }
    }

    /// Run until shutdown is requested. Only startup failures are returned;
    /// later reload failures are logged and the previous generation keeps
    /// running.
    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();
        self.logger.send(ActivityEvent::SupervisorStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config_hash.clone(),
        });

        fs::create_dir_all(&self.options.target_dir).map_err(|e| DiagError::io(&self.options.target_dir, e))?;
        let (watch_tx, watch_rx) = bounded::<WatchEvent>(WATCH_CHANNEL_CAP);
        let watcher = Watcher::spawn(&self.options.topo_dir, self.options.watch_settle, watch_tx)?;
        self.reload()?;

        let gc_cancel = CancelSource::new();
        let gc_join = match &self.options.gc {
            Some(settings) => Some(gc::spawn_worker(settings.clone(), gc_cancel.token(), self.logger.clone())?),
            None => None,
        };

        let reason = loop {
            if self.signals.should_shutdown() {
                break "shutdown requested";
            }
            let mut reload = self.signals.should_rescan();
            match watch_rx.recv_timeout(TICK) {
                Ok(WatchEvent::Reload) => reload = true,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break "topology watcher exited",
            }
            if reload && let Err(e) = self.reload() {
                eprintln!("[DIAG-SYNC] reload failed, keeping current lanes: {e}");
                self.logger.send(ActivityEvent::error(&e));
            }
        };

        eprintln!("[DIAG-SYNC] {reason}");
        watcher.stop();
        gc_cancel.cancel();
        if let Some(join) = gc_join {
            let _ = join.join();
        }
        self.manager.stop();

        let uptime_secs = started.elapsed().as_secs();
        self.logger.send(ActivityEvent::SupervisorStopped {
            reason: reason.to_string(),
            uptime_secs,
        });
        eprintln!("[DIAG-SYNC] stopped (uptime={uptime_secs}s)");
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        let tasks = self.options.plan()?;
        let count = tasks.len();
        self.manager.run_tasks(tasks)?;
        let generation = self.manager.generation();
        eprintln!("[DIAG-SYNC] topology generation {generation}: {count} lanes");
        self.logger.send(ActivityEvent::TopologyReloaded {
            generation,
            tasks: count,
        });
        Ok(())
    }
}
