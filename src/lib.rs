#![forbid(unsafe_code)]

//! gridguard: resource-pressure monitoring and cluster-wide admission
//! control for the members of an in-memory data grid.
//!
//! Each member samples its memory use, classifies it against eviction and
//! critical thresholds, and confirms changes through a hysteretic state
//! machine. Confirmed transitions fire local listeners and are broadcast to
//! peers, whose advisors keep an eventually-consistent view of which members
//! are critical. Writes and function executions targeting a critical member
//! are rejected synchronously; loads still run but are not cached.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use gridguard::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use gridguard::monitor::thresholds::{Thresholds, classify};
//! use gridguard::admission::region::Region;
//! ```

pub mod prelude;

pub mod admission;
pub mod cluster;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod platform;
pub mod resource;
