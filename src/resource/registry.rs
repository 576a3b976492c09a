//! Resource registry: listener table, event dispatch, statistics, and the
//! runtime threshold accessors for every monitored resource type.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::core::errors::{GridError, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::pressure::{PressureMonitor, TransitionSink};
use crate::monitor::thresholds::{ThresholdAxis, Thresholds};
use crate::resource::events::{ResourceEvent, ResourceType};
use crate::resource::stats::{ResourceStats, StatsSnapshot};

/// Callback for resource events, local and remote.
///
/// An `Err` or a panic is logged and isolated; other listeners still run.
pub trait ResourceListener: Send + Sync {
    fn on_event(&self, event: &ResourceEvent) -> Result<()>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "listener"
    }
}

impl<F> ResourceListener for F
where
    F: Fn(&ResourceEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ResourceEvent) -> Result<()> {
        self(event)
    }
}

/// Handle returned by [`ResourceRegistry::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

type ListenerTable = HashMap<ResourceType, Vec<(ListenerId, Arc<dyn ResourceListener>)>>;

pub struct ResourceRegistry {
    listeners: RwLock<ListenerTable>,
    next_id: AtomicU64,
    monitors: RwLock<HashMap<ResourceType, Weak<PressureMonitor>>>,
    stats: HashMap<ResourceType, ResourceStats>,
    logger: ActivityLoggerHandle,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new(logger: ActivityLoggerHandle) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            monitors: RwLock::new(HashMap::new()),
            stats: ResourceType::ALL
                .into_iter()
                .map(|r| (r, ResourceStats::default()))
                .collect(),
            logger,
        }
    }

    /// Register a listener; listeners for one resource run in registration order.
    pub fn add_listener(&self, resource: ResourceType, listener: Arc<dyn ResourceListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().entry(resource).or_default().push((id, listener));
        id
    }

    /// Returns `false` when `id` was not registered for `resource`.
    pub fn remove_listener(&self, resource: ResourceType, id: ListenerId) -> bool {
        let mut table = self.listeners.write();
        let Some(list) = table.get_mut(&resource) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    #[must_use]
    pub fn listeners(&self, resource: ResourceType) -> Vec<Arc<dyn ResourceListener>> {
        self.listeners
            .read()
            .get(&resource)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// Run every listener for the event's resource, synchronously, on the
    /// calling thread. The listener table lock is not held while listeners
    /// run, so they may register or remove listeners themselves.
    pub fn dispatch(&self, event: &ResourceEvent) {
        if let Some(stats) = self.stats.get(&event.resource) {
            stats.record(event);
            if event.is_local()
                && let Ok(monitor) = self.monitor(event.resource)
            {
                stats.set_thresholds(&monitor.thresholds());
            }
        }

        let targets: Vec<(ListenerId, Arc<dyn ResourceListener>)> = self
            .listeners
            .read()
            .get(&event.resource)
            .cloned()
            .unwrap_or_default();

        for (id, listener) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let err = GridError::ListenerFailed {
                listener: format!("{} ({id})", listener.name()),
                resource: event.resource,
                details: failure,
            };
            self.logger.send(ActivityEvent::ListenerFailed {
                resource: event.resource.to_string(),
                listener: format!("{} ({id})", listener.name()),
                error_message: err.to_string(),
            });
        }
    }

    /// Make a monitor's thresholds reachable through this registry.
    pub fn attach_monitor(&self, monitor: &Arc<PressureMonitor>) {
        if let Some(stats) = self.stats.get(&monitor.resource()) {
            stats.set_thresholds(&monitor.thresholds());
        }
        self.monitors
            .write()
            .insert(monitor.resource(), Arc::downgrade(monitor));
    }

    pub fn monitor(&self, resource: ResourceType) -> Result<Arc<PressureMonitor>> {
        self.monitors
            .read()
            .get(&resource)
            .and_then(Weak::upgrade)
            .ok_or(GridError::UnknownResource { resource })
    }

    pub fn eviction_percent(&self, resource: ResourceType) -> Result<f64> {
        Ok(self.monitor(resource)?.thresholds().percent(ThresholdAxis::Eviction))
    }

    pub fn critical_percent(&self, resource: ResourceType) -> Result<f64> {
        Ok(self.monitor(resource)?.thresholds().percent(ThresholdAxis::Critical))
    }

    pub fn set_eviction_percent(&self, resource: ResourceType, percent: f64) -> Result<()> {
        self.monitor(resource)?.set_eviction_percent(percent)
    }

    pub fn set_critical_percent(&self, resource: ResourceType, percent: f64) -> Result<()> {
        self.monitor(resource)?.set_critical_percent(percent)
    }

    pub fn tolerance(&self, resource: ResourceType) -> Result<u32> {
        Ok(self.monitor(resource)?.tolerance())
    }

    pub fn set_tolerance(&self, resource: ResourceType, tolerance: u32) -> Result<()> {
        self.monitor(resource)?.set_tolerance(tolerance);
        Ok(())
    }

    #[must_use]
    pub fn stats(&self, resource: ResourceType) -> StatsSnapshot {
        self.stats
            .get(&resource)
            .map(ResourceStats::snapshot)
            .unwrap_or_else(|| ResourceStats::default().snapshot())
    }
}

impl TransitionSink for ResourceRegistry {
    fn on_transition(&self, event: &ResourceEvent) {
        self.dispatch(event);
    }

    fn on_thresholds_changed(&self, resource: ResourceType, thresholds: &Thresholds) {
        if let Some(stats) = self.stats.get(&resource) {
            stats.set_thresholds(thresholds);
        }
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(ResourceType, usize)> = self
            .listeners
            .read()
            .iter()
            .map(|(r, l)| (*r, l.len()))
            .collect();
        f.debug_struct("ResourceRegistry")
            .field("listeners", &counts)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "listener panicked".to_string())
}
