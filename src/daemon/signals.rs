//! Signal handling for the node runner: SIGTERM/SIGINT request shutdown,
//! SIGHUP requests a threshold reload from the config file.
//!
//! The runner polls `SignalHandler` flags between sampling ticks rather than
//! blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

// ──────────────────── signal handler ────────────────────

/// Signal state shared between the OS hooks and the runner.
///
/// Flags use `Ordering::Relaxed`; the runner polls them every iteration.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks.
    ///
    /// Registration is best-effort; failures go to stderr but are not fatal.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// A handler driven only by the `request_*` methods.
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear the reload request.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[GG-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[GG-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                eprintln!("[GG-SIGNAL] failed to register SIGHUP: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandler")
            .field("shutdown", &self.shutdown_flag.load(Ordering::Relaxed))
            .field("reload", &self.reload_flag.load(Ordering::Relaxed))
            .finish()
    }
}

// ──────────────────── shutdown coordinator ────────────────────

/// Runs named shutdown steps in order within an overall time budget.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute the steps. Returns `true` if every step succeeded before the
    /// budget ran out; remaining steps are abandoned once it has.
    pub fn execute(&self, steps: &[(&str, &dyn Fn() -> bool)]) -> bool {
        let start = Instant::now();
        let mut all_ok = true;

        for (name, step) in steps {
            if start.elapsed() > self.timeout {
                eprintln!("[GG-SHUTDOWN] timeout reached, abandoning remaining steps");
                return false;
            }
            if step() {
                eprintln!("[GG-SHUTDOWN] {name}: ok");
            } else {
                eprintln!("[GG-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
        }

        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

// ──────────────────── tests ────────────────────
