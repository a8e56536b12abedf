//! Event-driven watcher over the topology directory.
//!
//! A non-recursive [`RecommendedWatcher`] reports filesystem events to the
//! `diag-watch` thread. Any create, modify or remove touching a `*.json`
//! descriptor opens a settle window; everything arriving inside it is
//! absorbed and one [`WatchEvent::Reload`] is sent when it closes.

#![allow(missing_docs)]

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

use crate::core::errors::{DiagError, Result};
use crate::syncer::cancel::{CancelSource, CancelToken};

/// Upper bound on how long a stop request goes unnoticed.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Reload,
}

type RawEvent = notify::Result<Event>;

/// True for events that can change the task set.
pub fn touches_descriptor(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    ) && event
        .paths
        .iter()
        .any(|path| path.extension().is_some_and(|ext| ext == "json"))
}

/// Handle to the `diag-watch` thread. Dropping it stops the thread and
/// releases the OS watch.
pub struct Watcher {
    stop: CancelSource,
    join: Option<thread::JoinHandle<()>>,
}

impl Watcher {
    /// Register the watch on `dir` before returning, so every change made
    /// after `spawn` is reported. `dir` must exist.
    pub fn spawn(dir: &Path, settle: Duration, events: Sender<WatchEvent>) -> Result<Self> {
        let (raw_tx, raw_rx) = unbounded::<RawEvent>();
        let mut inner = RecommendedWatcher::new(
            move |res: RawEvent| {
                let _ = raw_tx.send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|e| watch_error(dir, &e))?;
        inner
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(dir, &e))?;

        let stop = CancelSource::new();
        let token = stop.token();
        let join = thread::Builder::new()
            .name("diag-watch".to_string())
            .spawn(move || {
                // Owned here so the OS watch lives exactly as long as the loop.
                let _inner = inner;
                forward(&raw_rx, settle, &token, &events);
            })
            .map_err(|source| DiagError::Runtime {
                details: format!("failed to spawn watcher thread: {source}"),
            })?;

        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.halt();
    }
}

fn watch_error(dir: &Path, e: &notify::Error) -> DiagError {
    DiagError::Runtime {
        details: format!("failed to watch {}: {e}", dir.display()),
    }
}

fn forward(raw: &Receiver<RawEvent>, settle: Duration, token: &CancelToken, events: &Sender<WatchEvent>) {
    while !token.is_cancelled() {
        match raw.recv_timeout(TICK) {
            Ok(Ok(event)) if touches_descriptor(&event) => {
                if !absorb(raw, settle, token) {
                    return;
                }
                if events.send(WatchEvent::Reload).is_err() {
                    return;
                }
            }
            Ok(Ok(_)) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Err(e)) => eprintln!("[DIAG-WATCH] {e}"),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Swallow events until `settle` has passed. `false` means stop.
fn absorb(raw: &Receiver<RawEvent>, settle: Duration, token: &CancelToken) -> bool {
    let deadline = Instant::now() + settle;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match raw.recv_timeout(remaining.min(TICK)) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}
