//! Admission control: synchronous accept/reject decisions on data paths,
//! and the region surface that consults them.

pub mod guard;
pub mod region;
