//! Resource types and the events delivered to resource listeners.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::member::MemberId;
use crate::monitor::thresholds::MemoryState;

/// A monitored resource. Each type has its own monitor, listeners and
/// cluster view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    HeapMemory,
    OffHeapMemory,
}

impl ResourceType {
    pub const ALL: [Self; 2] = [Self::HeapMemory, Self::OffHeapMemory];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeapMemory => "heap memory",
            Self::OffHeapMemory => "off-heap memory",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Confirmed by this member's own pressure monitor.
    Local,
    /// Received from a peer through the cluster advisor.
    Remote,
}

/// One confirmed state boundary crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub resource: ResourceType,
    /// State reached at this boundary.
    pub state: MemoryState,
    /// State before this boundary.
    pub previous: MemoryState,
    /// Member's confirmed state once this event applies. Differs from
    /// `state` only for an axis-disabled notice issued while usage still
    /// classifies elsewhere, e.g. eviction turned off on a CRITICAL member.
    pub settled: MemoryState,
    /// Usage sample that triggered the transition.
    pub bytes_used: u64,
    pub max_bytes: u64,
    /// Member whose state changed.
    pub member: MemberId,
    pub origin: EventOrigin,
    pub timestamp: DateTime<Utc>,
}

impl ResourceEvent {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.origin == EventOrigin::Remote
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.origin == EventOrigin::Local
    }
}
