//! Resource types, events, listener registry and statistics.

pub mod events;
pub mod registry;
pub mod stats;
