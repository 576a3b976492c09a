//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use gridguard::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, ResourceConfig};
pub use crate::core::errors::{GridError, LowMemory, Result};

// Monitor
pub use crate::monitor::pressure::{PressureMonitor, TransitionSink};
pub use crate::monitor::sampler::{FakeSampler, MemorySample, MemorySampler, PlatformHeapSampler};
pub use crate::monitor::thresholds::{MemoryState, ThresholdAxis, Thresholds, classify};

// Resource events and listeners
pub use crate::resource::events::{EventOrigin, ResourceEvent, ResourceType};
pub use crate::resource::registry::{ListenerId, ResourceListener, ResourceRegistry};

// Cluster
pub use crate::cluster::advisor::ClusterAdvisor;
pub use crate::cluster::convergence::await_convergence;
pub use crate::cluster::member::MemberId;
pub use crate::cluster::message::RetractionScope;
pub use crate::cluster::transport::{LoopbackNetwork, Transport};

// Admission
pub use crate::admission::guard::{AdmissionGuard, ExecutionProfile, ExecutionTargets};
pub use crate::admission::region::{PartitionResolver, Region};

// Lifecycle
pub use crate::daemon::manager::{ResourceManager, Samplers};
pub use crate::daemon::sampling::SamplingLoop;
pub use crate::logger::activity::ActivityLoggerHandle;
