//! Lock-free per-resource statistics.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::monitor::thresholds::{MemoryState, Thresholds};
use crate::resource::events::ResourceEvent;

const STATES: usize = MemoryState::ALL.len();

/// Counters for one resource type, updated with relaxed atomics on every
/// dispatched event.
#[derive(Debug, Default)]
pub struct ResourceStats {
    local: [AtomicU64; STATES],
    remote: [AtomicU64; STATES],
    eviction_threshold_bytes: AtomicU64,
    critical_threshold_bytes: AtomicU64,
    eviction_start_events: AtomicU64,
    critical_events: AtomicU64,
}

impl ResourceStats {
    pub fn record(&self, event: &ResourceEvent) {
        let slot = usize::from(event.state.to_u8());
        if event.is_remote() {
            self.remote[slot].fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.local[slot].fetch_add(1, Ordering::Relaxed);
        match event.state {
            MemoryState::Eviction if event.previous.severity() < MemoryState::Eviction.severity() => {
                self.eviction_start_events.fetch_add(1, Ordering::Relaxed);
            }
            MemoryState::Critical => {
                self.critical_events.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Refresh the threshold gauges. A disabled axis reads as 0 bytes.
    pub fn set_thresholds(&self, thresholds: &Thresholds) {
        self.eviction_threshold_bytes
            .store(thresholds.eviction_bytes(), Ordering::Relaxed);
        self.critical_threshold_bytes
            .store(thresholds.critical_bytes(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counters: &[AtomicU64; STATES]| {
            MemoryState::ALL
                .iter()
                .map(|s| (*s, counters[usize::from(s.to_u8())].load(Ordering::Relaxed)))
                .collect()
        };
        StatsSnapshot {
            local: read(&self.local),
            remote: read(&self.remote),
            eviction_threshold_bytes: self.eviction_threshold_bytes.load(Ordering::Relaxed),
            critical_threshold_bytes: self.critical_threshold_bytes.load(Ordering::Relaxed),
            eviction_start_events: self.eviction_start_events.load(Ordering::Relaxed),
            critical_events: self.critical_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ResourceStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub local: Vec<(MemoryState, u64)>,
    pub remote: Vec<(MemoryState, u64)>,
    pub eviction_threshold_bytes: u64,
    pub critical_threshold_bytes: u64,
    pub eviction_start_events: u64,
    pub critical_events: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn local_count(&self, state: MemoryState) -> u64 {
        count(&self.local, state)
    }

    #[must_use]
    pub fn remote_count(&self, state: MemoryState) -> u64 {
        count(&self.remote, state)
    }
}

fn count(counters: &[(MemoryState, u64)], state: MemoryState) -> u64 {
    counters
        .iter()
        .find(|(s, _)| *s == state)
        .map_or(0, |(_, n)| *n)
}
