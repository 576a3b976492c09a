//! Memory pressure monitoring: threshold classification, usage sampling,
//! and the hysteretic per-resource state machine.

pub mod pressure;
pub mod sampler;
pub mod thresholds;
