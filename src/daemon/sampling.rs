//! Periodic sampling: one thread per monitored resource, each the only
//! writer of its monitor's state.
//!
//! Threads sleep on a shutdown channel with `recv_timeout`, so stopping the
//! loop wakes them immediately instead of waiting out the poll interval.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::core::errors::{GridError, Result};
use crate::monitor::pressure::PressureMonitor;

/// Running sampling threads. Dropping it stops them.
pub struct SamplingLoop {
    shutdown_tx: Option<Sender<()>>,
    workers: Vec<thread::JoinHandle<u64>>,
}

impl SamplingLoop {
    /// Start one sampling thread per monitor. Each samples immediately and
    /// then every `interval`.
    pub fn spawn<I>(monitors: I, interval: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<PressureMonitor>>,
    {
        if interval.is_zero() {
            return Err(GridError::InvalidConfig {
                details: "sampling interval must be > 0".to_string(),
            });
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut running = Self {
            shutdown_tx: Some(shutdown_tx),
            workers: Vec::new(),
        };
        for monitor in monitors {
            let rx = shutdown_rx.clone();
            let name = format!("gg-sampler-{}", monitor.resource());
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || sampler_thread_main(&monitor, &rx, interval))
                .map_err(|source| GridError::Runtime {
                    details: format!("failed to spawn sampling thread: {source}"),
                })?;
            running.workers.push(handle);
        }
        Ok(running)
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop every thread and wait for it. Returns the number of ticks run
    /// across all threads.
    pub fn stop(mut self) -> u64 {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> u64 {
        drop(self.shutdown_tx.take());
        self.workers
            .drain(..)
            .map(|handle| handle.join().unwrap_or(0))
            .sum()
    }
}

impl Drop for SamplingLoop {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

impl std::fmt::Debug for SamplingLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingLoop")
            .field("threads", &self.workers.len())
            .field("running", &self.shutdown_tx.is_some())
            .finish()
    }
}

fn sampler_thread_main(monitor: &PressureMonitor, shutdown_rx: &Receiver<()>, interval: Duration) -> u64 {
    let mut ticks = 0_u64;
    loop {
        // Failures are logged by the monitor; the cycle is skipped.
        let _ = monitor.sample_now();
        ticks += 1;
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return ticks,
        }
    }
}
