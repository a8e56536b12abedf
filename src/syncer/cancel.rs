//! Generation-scoped cancellation.
//!
//! A [`CancelSource`] owns one generation of sync lanes; each lane holds a
//! cloned [`CancelToken`]. Cancelling sets a flag and drops the only sender
//! of a crossbeam channel, which wakes every token blocked in
//! [`CancelToken::sleep`] at once.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct CancelSource {
    flag: Arc<AtomicBool>,
    wake: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            wake: Mutex::new(Some(tx)),
            rx,
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.flag),
            rx: self.rx.clone(),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `dur`. Returns `true` if woken by cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.rx.recv_timeout(dur) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}
