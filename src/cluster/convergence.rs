//! Bounded waiting for eventually-consistent cluster state.
//!
//! Admission checks never wait. Coordination code that needs certainty, such
//! as "every peer has dropped the departed member", polls here with a hard
//! deadline instead.

use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::ClusterConfig;
use crate::core::errors::{GridError, Result};

/// Poll `condition` every `poll` until it holds or `timeout` elapses.
///
/// The condition is always evaluated at least once, and once more at the
/// deadline.
pub fn await_convergence<F>(what: &str, timeout: Duration, poll: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(GridError::ConvergenceTimeout {
                what: what.to_string(),
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }
        thread::sleep(poll.min(deadline - now));
    }
}

/// [`await_convergence`] with the configured timeout and poll interval.
pub fn await_with<F>(config: &ClusterConfig, what: &str, condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    await_convergence(
        what,
        Duration::from_millis(config.convergence_timeout_ms),
        Duration::from_millis(config.convergence_poll_ms),
        condition,
    )
}
