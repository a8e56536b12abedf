//! Process signals for the sync supervisor: SIGTERM/SIGINT stop it, SIGHUP
//! forces a topology rescan.
//!
//! Handlers only flip atomic flags (signal-hook `flag::register`); the
//! supervisor loop polls them on every tick.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    rescan_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Flags plus OS registration. Registration failures are logged and
    /// otherwise ignored.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// Flags only; nothing is registered with the OS.
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            rescan_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Reads and clears the rescan request.
    pub fn should_rescan(&self) -> bool {
        self.rescan_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_rescan(&self) {
        self.rescan_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag)) {
                eprintln!("[DIAG-SIGNAL] failed to register {name}: {e}");
            }
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.rescan_flag)) {
                eprintln!("[DIAG-SIGNAL] failed to register SIGHUP: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
