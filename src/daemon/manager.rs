//! Resource manager: one member's monitors, registry, advisor and admission
//! guard, wired together and joined to the cluster.
//!
//! Wiring order matters. Each monitor feeds the advisor before the registry,
//! so by the time a local listener runs, admission already reflects the new
//! state.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::admission::guard::AdmissionGuard;
use crate::admission::region::Region;
use crate::cluster::advisor::{ClusterAdvisor, join_cluster, leave_cluster};
use crate::cluster::convergence::await_with;
use crate::cluster::member::MemberId;
use crate::cluster::message::RetractionScope;
use crate::cluster::transport::Transport;
use crate::core::config::{Config, ResourceConfig};
use crate::core::errors::{GridError, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::pressure::{PressureMonitor, TransitionSink};
use crate::monitor::sampler::{MemorySampler, PlatformHeapSampler};
use crate::platform::pal::detect_platform;
use crate::resource::events::ResourceType;
use crate::resource::registry::ResourceRegistry;

/// Samplers for the monitored resources.
///
/// Heap falls back to the platform reader when not supplied. Off-heap is
/// monitored only when a sampler is supplied.
#[derive(Default, Clone)]
pub struct Samplers {
    pub heap: Option<Arc<dyn MemorySampler>>,
    pub off_heap: Option<Arc<dyn MemorySampler>>,
}

impl Samplers {
    #[must_use]
    pub fn heap(sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            heap: Some(sampler),
            off_heap: None,
        }
    }

    #[must_use]
    pub fn with_off_heap(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.off_heap = Some(sampler);
        self
    }
}

impl std::fmt::Debug for Samplers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Samplers")
            .field("heap", &self.heap.is_some())
            .field("off_heap", &self.off_heap.is_some())
            .finish()
    }
}

pub struct ResourceManager {
    config: Config,
    registry: Arc<ResourceRegistry>,
    advisor: Arc<ClusterAdvisor>,
    guard: Arc<AdmissionGuard>,
    monitors: BTreeMap<ResourceType, Arc<PressureMonitor>>,
    logger: ActivityLoggerHandle,
    started: Instant,
    closed: AtomicBool,
}

impl ResourceManager {
    /// Build every component, join the cluster through `transport`, and
    /// announce the initial local state to peers.
    pub fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        samplers: Samplers,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        config.validate()?;
        let member = transport.local_member().clone();

        let registry = Arc::new(ResourceRegistry::new(logger.clone()));
        let advisor = Arc::new(ClusterAdvisor::new(
            transport,
            Arc::clone(&registry),
            logger.clone(),
        ));
        let guard = Arc::new(AdmissionGuard::new(Arc::clone(&advisor), logger.clone()));

        let heap_sampler = match samplers.heap {
            Some(sampler) => sampler,
            None => Arc::new(PlatformHeapSampler::new(detect_platform()?)),
        };
        let mut sources: Vec<(ResourceType, Arc<dyn MemorySampler>)> =
            vec![(ResourceType::HeapMemory, heap_sampler)];
        if let Some(off_heap) = samplers.off_heap {
            sources.push((ResourceType::OffHeapMemory, off_heap));
        }

        let mut monitors = BTreeMap::new();
        for (resource, sampler) in sources {
            let monitor = Arc::new(PressureMonitor::new(
                resource,
                member.clone(),
                sampler,
                config.resource(resource),
                logger.clone(),
            )?);
            monitor.add_sink(Arc::clone(&advisor) as Arc<dyn TransitionSink>);
            monitor.add_sink(Arc::clone(&registry) as Arc<dyn TransitionSink>);
            registry.attach_monitor(&monitor);
            monitors.insert(resource, monitor);
        }

        join_cluster(&advisor)?;
        for monitor in monitors.values() {
            let thresholds = monitor.thresholds();
            advisor.announce_local(
                monitor.resource(),
                monitor.state(),
                monitor.last_usage(),
                thresholds.max_bytes,
            );
        }

        logger.send(ActivityEvent::MemberStarted {
            member: member.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: config.stable_hash().unwrap_or_default(),
        });

        Ok(Self {
            config,
            registry,
            advisor,
            guard,
            monitors,
            logger,
            started: Instant::now(),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn member(&self) -> &MemberId {
        self.advisor.local_member()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn advisor(&self) -> &Arc<ClusterAdvisor> {
        &self.advisor
    }

    #[must_use]
    pub const fn guard(&self) -> &Arc<AdmissionGuard> {
        &self.guard
    }

    pub fn monitor(&self, resource: ResourceType) -> Result<&Arc<PressureMonitor>> {
        self.monitors
            .get(&resource)
            .ok_or(GridError::UnknownResource { resource })
    }

    pub fn monitors(&self) -> impl Iterator<Item = &Arc<PressureMonitor>> {
        self.monitors.values()
    }

    /// A replicated region on this member, gated by this member's guard.
    #[must_use]
    pub fn region<K, V>(&self, name: &str) -> Region<K, V>
    where
        K: Eq + std::hash::Hash + Clone,
        V: Clone,
    {
        Region::replicated(name, Arc::clone(&self.guard))
    }

    /// Sample every monitored resource once. Sampling failures are logged
    /// by the monitor and do not stop the other resources.
    pub fn sample_all(&self) {
        for monitor in self.monitors.values() {
            let _ = monitor.sample_now();
        }
    }

    /// Wait for eventually-consistent cluster state, bounded by the
    /// configured convergence timeout and polled at the configured interval.
    pub fn await_cluster<F>(&self, what: &str, condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        await_with(&self.config.cluster, what, condition)
    }

    /// Apply the resource settings of a reloaded configuration.
    pub fn apply_thresholds(&self, config: &Config) -> Result<()> {
        config.validate()?;
        for monitor in self.monitors.values() {
            apply_resource_settings(monitor, config.resource(monitor.resource()))?;
        }
        Ok(())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Retract this member cluster-wide, then leave the transport.
    /// Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.advisor.retract_local(RetractionScope::Member);
        leave_cluster(&self.advisor);
        self.logger.send(ActivityEvent::MemberStopped {
            member: self.member().to_string(),
            reason: reason.to_string(),
            uptime_secs: self.uptime_secs(),
        });
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.close("dropped");
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("member", self.member())
            .field("resources", &self.monitors.keys().collect::<Vec<_>>())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Move a monitor to new settings. The two percents are applied in the
/// order that keeps every intermediate pair valid.
fn apply_resource_settings(monitor: &PressureMonitor, settings: &ResourceConfig) -> Result<()> {
    let current = monitor.thresholds();
    let raise_critical_first =
        current.critical_percent > 0.0 && settings.eviction_percent > current.critical_percent;
    if raise_critical_first {
        monitor.set_critical_percent(settings.critical_percent)?;
        monitor.set_eviction_percent(settings.eviction_percent)?;
    } else {
        monitor.set_eviction_percent(settings.eviction_percent)?;
        monitor.set_critical_percent(settings.critical_percent)?;
    }
    if monitor.tolerance() != settings.tolerance {
        monitor.set_tolerance(settings.tolerance);
    }
    monitor.set_max_bytes(settings.max_bytes)
}
