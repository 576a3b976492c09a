//! Pressure monitor: the per-member, per-resource state machine.
//!
//! Each tick classifies a usage sample and feeds the result through
//! asymmetric hysteresis: escalation needs `tolerance + 1` consecutive equal
//! worse candidates, de-escalation is immediate. A confirmed change is
//! expanded into one event per state boundary crossed and queued; the queue
//! is drained by whichever caller gets there first, outside the state lock,
//! so sinks may call back into the monitor.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::cluster::member::MemberId;
use crate::core::config::ResourceConfig;
use crate::core::errors::{GridError, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::sampler::{MemorySample, MemorySampler};
use crate::monitor::thresholds::{MemoryState, ThresholdAxis, Thresholds, classify};
use crate::resource::events::{EventOrigin, ResourceEvent, ResourceType};

/// Receiver of confirmed local transitions.
pub trait TransitionSink: Send + Sync {
    fn on_transition(&self, event: &ResourceEvent);

    /// Thresholds were reconfigured; the new snapshot is authoritative.
    fn on_thresholds_changed(&self, _resource: ResourceType, _thresholds: &Thresholds) {}
}

/// Hysteresis bookkeeping. Only the monitor mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorState {
    pub current: MemoryState,
    /// Candidate seen on the previous sample.
    pub last_candidate: Option<MemoryState>,
    /// Consecutive samples of `last_candidate` while it is worse than `current`.
    pub tolerance_counter: u32,
}

impl MonitorState {
    #[must_use]
    pub const fn new(current: MemoryState) -> Self {
        Self {
            current,
            last_candidate: None,
            tolerance_counter: 0,
        }
    }

    /// Feed one candidate. Returns the previously confirmed state when the
    /// candidate is confirmed.
    pub fn step(&mut self, candidate: MemoryState, tolerance: u32) -> Option<MemoryState> {
        let previous_candidate = self.last_candidate.replace(candidate);

        if candidate == self.current {
            self.tolerance_counter = 0;
            return None;
        }

        if candidate.severity() > self.current.severity() {
            self.tolerance_counter = if previous_candidate == Some(candidate) {
                self.tolerance_counter.saturating_add(1)
            } else {
                1
            };
            if self.tolerance_counter <= tolerance {
                return None;
            }
        }

        self.tolerance_counter = 0;
        Some(std::mem::replace(&mut self.current, candidate))
    }

    /// Replace the confirmed state without going through hysteresis.
    fn force(&mut self, state: MemoryState) {
        self.current = state;
        self.last_candidate = Some(state);
        self.tolerance_counter = 0;
    }
}

/// States reached, in order, when moving from `from` to `to`.
///
/// Escalating from below EVICTION straight to CRITICAL, or recovering from
/// CRITICAL straight to below EVICTION, passes through an EVICTION boundary
/// when that axis is enabled.
#[must_use]
pub fn boundaries_crossed(from: MemoryState, to: MemoryState, eviction_enabled: bool) -> Vec<MemoryState> {
    let skips_eviction = (from.severity() == 0 && to.severity() == 2)
        || (from.severity() == 2 && to.severity() == 0);
    if skips_eviction && eviction_enabled {
        vec![MemoryState::Eviction, to]
    } else {
        vec![to]
    }
}

struct Inner {
    state: MonitorState,
    eviction_percent: f64,
    critical_percent: f64,
    tolerance: u32,
    max_override: Option<u64>,
    sampled_max: u64,
    last_usage: u64,
}

impl Inner {
    fn thresholds(&self) -> Thresholds {
        Thresholds::new(
            self.max_override.unwrap_or(self.sampled_max),
            self.eviction_percent,
            self.critical_percent,
        )
    }
}

/// Local memory state machine for one resource type.
pub struct PressureMonitor {
    resource: ResourceType,
    member: MemberId,
    sampler: Arc<dyn MemorySampler>,
    inner: Mutex<Inner>,
    mirror: AtomicU8,
    queue_tx: Sender<ResourceEvent>,
    queue_rx: Receiver<ResourceEvent>,
    dispatching: AtomicBool,
    sinks: RwLock<Vec<Arc<dyn TransitionSink>>>,
    logger: ActivityLoggerHandle,
}

impl PressureMonitor {
    /// Build a monitor from resource settings. The initial state is the
    /// classification of zero usage; no event is emitted for it.
    pub fn new(
        resource: ResourceType,
        member: MemberId,
        sampler: Arc<dyn MemorySampler>,
        settings: &ResourceConfig,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        settings.thresholds(1).validate()?;
        if settings.max_bytes == Some(0) {
            return Err(GridError::InvalidConfig {
                details: "max_bytes override must be > 0".to_string(),
            });
        }

        let mut inner = Inner {
            state: MonitorState::new(MemoryState::Normal),
            eviction_percent: settings.eviction_percent,
            critical_percent: settings.critical_percent,
            tolerance: settings.tolerance,
            max_override: settings.max_bytes,
            sampled_max: 0,
            last_usage: 0,
        };
        let initial = classify(0, &inner.thresholds());
        inner.state = MonitorState::new(initial);

        let (queue_tx, queue_rx) = unbounded();
        Ok(Self {
            resource,
            member,
            sampler,
            inner: Mutex::new(inner),
            mirror: AtomicU8::new(initial.to_u8()),
            queue_tx,
            queue_rx,
            dispatching: AtomicBool::new(false),
            sinks: RwLock::new(Vec::new()),
            logger,
        })
    }

    #[must_use]
    pub const fn resource(&self) -> ResourceType {
        self.resource
    }

    #[must_use]
    pub const fn member(&self) -> &MemberId {
        &self.member
    }

    /// Confirmed state, read without locking.
    #[must_use]
    pub fn state(&self) -> MemoryState {
        MemoryState::from_u8(self.mirror.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn monitor_state(&self) -> MonitorState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        self.inner.lock().thresholds()
    }

    #[must_use]
    pub fn tolerance(&self) -> u32 {
        self.inner.lock().tolerance
    }

    /// Most recent usage value fed to the classifier.
    #[must_use]
    pub fn last_usage(&self) -> u64 {
        self.inner.lock().last_usage
    }

    pub fn add_sink(&self, sink: Arc<dyn TransitionSink>) {
        self.sinks.write().push(sink);
    }

    /// Take one sample and run it through the pipeline.
    ///
    /// A sampler failure is logged and returned; the confirmed state is left
    /// untouched.
    pub fn sample_now(&self) -> Result<MemoryState> {
        match self.sampler.sample() {
            Ok(sample) => Ok(self.observe_sample(sample)),
            Err(err) => {
                let err = GridError::Sampling {
                    resource: self.resource,
                    details: err.to_string(),
                };
                self.logger.send(ActivityEvent::SampleFailed {
                    resource: self.resource.to_string(),
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Feed a full sample (usage and sampler maximum).
    pub fn observe_sample(&self, sample: MemorySample) -> MemoryState {
        let state = {
            let mut inner = self.inner.lock();
            inner.sampled_max = sample.max_bytes;
            self.process_locked(&mut inner, sample.bytes_used)
        };
        self.drain();
        state
    }

    /// Feed a usage value against the current maximum.
    pub fn observe(&self, bytes_used: u64) -> MemoryState {
        let state = {
            let mut inner = self.inner.lock();
            self.process_locked(&mut inner, bytes_used)
        };
        self.drain();
        state
    }

    pub fn set_eviction_percent(&self, percent: f64) -> Result<()> {
        self.set_percent(ThresholdAxis::Eviction, percent)
    }

    pub fn set_critical_percent(&self, percent: f64) -> Result<()> {
        self.set_percent(ThresholdAxis::Critical, percent)
    }

    /// Change one threshold axis and re-classify the cached usage at once.
    ///
    /// Turning an enabled axis off emits its `*Disabled` event immediately,
    /// regardless of hysteresis.
    pub fn set_percent(&self, axis: ThresholdAxis, percent: f64) -> Result<()> {
        let thresholds = {
            let mut inner = self.inner.lock();
            let proposed = inner.thresholds().with_percent(axis, percent);
            proposed.validate()?;

            let was_enabled = inner.thresholds().is_enabled(axis);
            match axis {
                ThresholdAxis::Eviction => inner.eviction_percent = percent,
                ThresholdAxis::Critical => inner.critical_percent = percent,
            }

            if was_enabled && percent == 0.0 {
                self.disable_axis_locked(&mut inner, axis);
            } else {
                let usage = inner.last_usage;
                self.process_locked(&mut inner, usage);
            }
            inner.thresholds()
        };

        self.logger.send(ActivityEvent::ThresholdChanged {
            resource: self.resource.to_string(),
            details: format!("{}_percent={percent}", axis.as_str()),
        });
        self.thresholds_changed(&thresholds);
        self.drain();
        Ok(())
    }

    /// Replace the tolerance. Applies from the next sample.
    pub fn set_tolerance(&self, tolerance: u32) {
        self.inner.lock().tolerance = tolerance;
        self.logger.send(ActivityEvent::ThresholdChanged {
            resource: self.resource.to_string(),
            details: format!("tolerance={tolerance}"),
        });
    }

    /// Override (or with `None`, stop overriding) the sampler's maximum and
    /// re-classify the cached usage.
    pub fn set_max_bytes(&self, max_bytes: Option<u64>) -> Result<()> {
        if max_bytes == Some(0) {
            return Err(GridError::InvalidConfig {
                details: "max_bytes override must be > 0".to_string(),
            });
        }
        let thresholds = {
            let mut inner = self.inner.lock();
            inner.max_override = max_bytes;
            let usage = inner.last_usage;
            self.process_locked(&mut inner, usage);
            inner.thresholds()
        };
        self.logger.send(ActivityEvent::ThresholdChanged {
            resource: self.resource.to_string(),
            details: format!("max_bytes={max_bytes:?}"),
        });
        self.thresholds_changed(&thresholds);
        self.drain();
        Ok(())
    }

    fn process_locked(&self, inner: &mut Inner, bytes_used: u64) -> MemoryState {
        inner.last_usage = bytes_used;
        let thresholds = inner.thresholds();
        let candidate = classify(bytes_used, &thresholds);
        let tolerance = inner.tolerance;

        if let Some(from) = inner.state.step(candidate, tolerance) {
            let mut previous = from;
            for state in boundaries_crossed(from, candidate, thresholds.is_enabled(ThresholdAxis::Eviction)) {
                self.enqueue_locked(previous, state, candidate, bytes_used, thresholds.max_bytes);
                previous = state;
            }
            self.mirror.store(candidate.to_u8(), Ordering::Release);
        }
        inner.state.current
    }

    fn disable_axis_locked(&self, inner: &mut Inner, axis: ThresholdAxis) {
        let thresholds = inner.thresholds();
        let usage = inner.last_usage;
        let disabled = axis.disabled_state();
        let from = inner.state.current;

        let settled = classify(usage, &thresholds);
        self.enqueue_locked(from, disabled, settled, usage, thresholds.max_bytes);
        // A second event only when the member actually moves somewhere else,
        // e.g. eviction turned off while a critical escalation was pending.
        if settled != disabled && settled != from {
            self.enqueue_locked(disabled, settled, settled, usage, thresholds.max_bytes);
        }
        inner.state.force(settled);
        self.mirror.store(settled.to_u8(), Ordering::Release);
    }

    fn enqueue_locked(
        &self,
        previous: MemoryState,
        state: MemoryState,
        settled: MemoryState,
        bytes_used: u64,
        max_bytes: u64,
    ) {
        let event = ResourceEvent {
            resource: self.resource,
            state,
            previous,
            settled,
            bytes_used,
            max_bytes,
            member: self.member.clone(),
            origin: EventOrigin::Local,
            timestamp: Utc::now(),
        };
        self.logger.send(ActivityEvent::StateConfirmed {
            member: self.member.to_string(),
            resource: self.resource.to_string(),
            from: previous.to_string(),
            to: state.to_string(),
            bytes_used,
            max_bytes,
        });
        // Both ends live in `self`, so the send cannot fail.
        let _ = self.queue_tx.send(event);
    }

    fn thresholds_changed(&self, thresholds: &Thresholds) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.on_thresholds_changed(self.resource, thresholds);
        }
    }

    /// Deliver queued events in order. Only one caller drains at a time; a
    /// reentrant caller returns at once and its events are picked up by the
    /// loop already running.
    fn drain(&self) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
            while let Ok(event) = self.queue_rx.try_recv() {
                let sinks = self.sinks.read().clone();
                for sink in &sinks {
                    sink.on_transition(&event);
                }
            }
            self.dispatching.store(false, Ordering::Release);
            if self.queue_rx.is_empty() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("resource", &self.resource)
            .field("member", &self.member)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
