//! Member lifecycle: the resource manager facade, periodic sampling, and
//! the signal-driven node runner.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod manager;
pub mod sampling;
#[cfg(feature = "daemon")]
pub mod signals;
