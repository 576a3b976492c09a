//! Platform abstraction layer: OS memory readers.

pub mod pal;
