//! Activity logger: a dedicated thread owns the JSONL writer.
//!
//! Every other thread (sampling loop, transport delivery, operation threads)
//! holds an [`ActivityLoggerHandle`] and sends [`ActivityEvent`]s through a
//! bounded crossbeam channel. `send()` uses `try_send()`, so a slow disk can
//! never stall a state transition or an admission check.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{GridError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Events understood by the logger thread.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    MemberStarted {
        member: String,
        version: String,
        config_hash: String,
    },
    MemberStopped {
        member: String,
        reason: String,
        uptime_secs: u64,
    },
    StateConfirmed {
        member: String,
        resource: String,
        from: String,
        to: String,
        bytes_used: u64,
        max_bytes: u64,
    },
    RemoteStateObserved {
        member: String,
        resource: String,
        state: String,
    },
    SampleFailed {
        resource: String,
        error_code: String,
        error_message: String,
    },
    ThresholdChanged {
        resource: String,
        details: String,
    },
    ListenerFailed {
        resource: String,
        listener: String,
        error_message: String,
    },
    OperationRejected {
        resource: String,
        operation: String,
        region: Option<String>,
        members: Vec<String>,
    },
    PropagationFailed {
        member: String,
        error_code: String,
        error_message: String,
    },
    MemberDeparted {
        member: String,
    },
    ScopeRetracted {
        member: String,
        scope: String,
    },
    ScopeRestored {
        member: String,
        region: String,
    },
    /// Sentinel asking the logger thread to flush and exit.
    Shutdown,
}

/// Cheaply cloneable sender side of the activity log.
///
/// A detached handle has no logger thread behind it and silently discards
/// everything; it is what library embedders and unit tests use.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Option<Sender<ActivityEvent>>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    #[must_use]
    pub fn detached() -> Self {
        Self {
            tx: None,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an event. Never blocks; a full channel drops the event and
    /// bumps the dropped counter.
    pub fn send(&self, event: ActivityEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(TrySendError::Full(_)) = tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped since the logger thread last reported them.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.tx.is_none()
    }

    /// Ask the logger thread to flush and stop. Blocks only if the channel
    /// is full, which is acceptable at shutdown.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ActivityEvent::Shutdown);
        }
    }
}

impl std::fmt::Debug for ActivityLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLoggerHandle")
            .field("detached", &self.is_detached())
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

/// Spawn the logger thread.
pub fn spawn_logger(
    jsonl_config: JsonlConfig,
    channel_capacity: usize,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx: Some(tx),
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("gg-logger".to_string())
        .spawn(move || logger_thread_main(&rx, jsonl_config, &dropped))
        .map_err(|e| GridError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::LogDropped, Severity::Warning);
            warn.details = Some(format!("{lost} activity events dropped under back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&to_log_entry(&event));
        if rx.is_empty() {
            jsonl.flush();
            jsonl.try_recover();
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

#[allow(clippy::too_many_lines)]
fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::MemberStarted {
            member,
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::MemberStart, Severity::Info);
            e.member = Some(member.clone());
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::MemberStopped {
            member,
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::MemberStop, Severity::Info);
            e.member = Some(member.clone());
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::StateConfirmed {
            member,
            resource,
            from,
            to,
            bytes_used,
            max_bytes,
        } => {
            let severity = match to.as_str() {
                "CRITICAL" => Severity::Critical,
                "EVICTION" => Severity::Warning,
                _ => Severity::Info,
            };
            let mut e = LogEntry::new(EventType::StateChange, severity);
            e.member = Some(member.clone());
            e.resource = Some(resource.clone());
            e.state = Some(format!("{from}->{to}"));
            e.bytes_used = Some(*bytes_used);
            e.max_bytes = Some(*max_bytes);
            e
        }
        ActivityEvent::RemoteStateObserved {
            member,
            resource,
            state,
        } => {
            let mut e = LogEntry::new(EventType::RemoteState, Severity::Info);
            e.member = Some(member.clone());
            e.resource = Some(resource.clone());
            e.state = Some(state.clone());
            e
        }
        ActivityEvent::SampleFailed {
            resource,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::SampleFailed, Severity::Warning);
            e.resource = Some(resource.clone());
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::ThresholdChanged { resource, details } => {
            let mut e = LogEntry::new(EventType::ThresholdChange, Severity::Info);
            e.resource = Some(resource.clone());
            e.details = Some(details.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::ListenerFailed {
            resource,
            listener,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::ListenerFailed, Severity::Warning);
            e.resource = Some(resource.clone());
            e.details = Some(format!("listener={listener}"));
            e.error_message = Some(error_message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::OperationRejected {
            resource,
            operation,
            region,
            members,
        } => {
            let mut e = LogEntry::new(EventType::OperationRejected, Severity::Warning);
            e.resource = Some(resource.clone());
            e.region.clone_from(region);
            e.members = Some(members.clone());
            e.details = Some(format!("operation={operation}"));
            e.error_code = Some("GG-2101".to_string());
            e.ok = Some(false);
            e
        }
        ActivityEvent::PropagationFailed {
            member,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::PropagationFailed, Severity::Warning);
            e.member = Some(member.clone());
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::MemberDeparted { member } => {
            let mut e = LogEntry::new(EventType::MemberDeparted, Severity::Info);
            e.member = Some(member.clone());
            e
        }
        ActivityEvent::ScopeRetracted { member, scope } => {
            let mut e = LogEntry::new(EventType::ScopeRetracted, Severity::Info);
            e.member = Some(member.clone());
            e.details = Some(scope.clone());
            e
        }
        ActivityEvent::ScopeRestored { member, region } => {
            let mut e = LogEntry::new(EventType::ScopeRestored, Severity::Info);
            e.member = Some(member.clone());
            e.region = Some(region.clone());
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::MemberStop, Severity::Info),
    }
}
