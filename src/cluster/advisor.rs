//! Cluster advisor: each member's view of every member's memory state.
//!
//! Per resource type the view is an immutable [`ResourceView`] behind an
//! `Arc`. Writers (the local monitor and the inbound delivery thread) build
//! a modified copy under the write lock and swap it in; admission checks
//! clone the `Arc` and never wait on a writer for longer than the swap.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::cluster::member::MemberId;
use crate::cluster::message::{AdvisorMessage, RetractionScope};
use crate::cluster::transport::{MessageHandler, Transport};
use crate::core::errors::{GridError, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::pressure::TransitionSink;
use crate::monitor::thresholds::MemoryState;
use crate::resource::events::{EventOrigin, ResourceEvent, ResourceType};
use crate::resource::registry::ResourceRegistry;

/// Last known state of one member for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberProfile {
    pub member: MemberId,
    pub resource: ResourceType,
    pub state: MemoryState,
    /// Sender sequence of the message that produced this profile.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Immutable snapshot of the cluster state for one resource type.
#[derive(Debug, Clone, Default)]
pub struct ResourceView {
    profiles: BTreeMap<MemberId, MemberProfile>,
    /// Regions each member no longer hosts.
    region_retractions: BTreeMap<MemberId, BTreeSet<String>>,
    sick: BTreeSet<MemberId>,
}

impl ResourceView {
    #[must_use]
    pub fn profile(&self, member: &MemberId) -> Option<&MemberProfile> {
        self.profiles.get(member)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &MemberProfile> {
        self.profiles.values()
    }

    /// Members currently CRITICAL.
    #[must_use]
    pub const fn sick(&self) -> &BTreeSet<MemberId> {
        &self.sick
    }

    /// Whether `member` is sick as far as `region` is concerned. A member
    /// that retracted the region is never sick for it.
    #[must_use]
    pub fn is_sick(&self, member: &MemberId, region: Option<&str>) -> bool {
        self.sick.contains(member) && !region.is_some_and(|r| self.has_retracted(member, r))
    }

    #[must_use]
    pub fn sick_for_region(&self, region: &str) -> BTreeSet<MemberId> {
        self.sick
            .iter()
            .filter(|m| !self.has_retracted(m, region))
            .cloned()
            .collect()
    }

    fn has_retracted(&self, member: &MemberId, region: &str) -> bool {
        self.region_retractions
            .get(member)
            .is_some_and(|regions| regions.contains(region))
    }

    /// Members with a profile or a region retraction on record.
    fn members(&self) -> impl Iterator<Item = &MemberId> {
        self.profiles.keys().chain(self.region_retractions.keys())
    }

    fn knows(&self, member: &MemberId) -> bool {
        self.profiles.contains_key(member) || self.region_retractions.contains_key(member)
    }

    fn forget(&mut self, member: &MemberId) -> bool {
        let removed = self.profiles.remove(member).is_some();
        let retractions = self.region_retractions.remove(member).is_some();
        removed || retractions
    }

    fn recompute(&mut self) {
        self.sick = self
            .profiles
            .values()
            .filter(|p| p.state.is_critical())
            .map(|p| p.member.clone())
            .collect();
    }
}

pub struct ClusterAdvisor {
    local: MemberId,
    transport: Arc<dyn Transport>,
    registry: Arc<ResourceRegistry>,
    views: HashMap<ResourceType, RwLock<Arc<ResourceView>>>,
    /// Last local state message per resource, replayed to newcomers.
    local_announcements: Mutex<HashMap<ResourceType, AdvisorMessage>>,
    local_retracted_regions: Mutex<BTreeSet<String>>,
    local_sequence: AtomicU64,
    /// Members that left the view. Their late messages are dropped until
    /// they join again.
    departed: Mutex<BTreeSet<MemberId>>,
    logger: ActivityLoggerHandle,
}

impl ClusterAdvisor {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ResourceRegistry>,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            local: transport.local_member().clone(),
            transport,
            registry,
            views: ResourceType::ALL
                .into_iter()
                .map(|r| (r, RwLock::new(Arc::new(ResourceView::default()))))
                .collect(),
            local_announcements: Mutex::new(HashMap::new()),
            local_retracted_regions: Mutex::new(BTreeSet::new()),
            local_sequence: AtomicU64::new(0),
            departed: Mutex::new(BTreeSet::new()),
            logger,
        }
    }

    #[must_use]
    pub const fn local_member(&self) -> &MemberId {
        &self.local
    }

    /// Current view for `resource`. Cheap: one `Arc` clone.
    #[must_use]
    pub fn snapshot(&self, resource: ResourceType) -> Arc<ResourceView> {
        self.views
            .get(&resource)
            .map(|view| Arc::clone(&view.read()))
            .unwrap_or_default()
    }

    /// Current sick set.
    #[must_use]
    pub fn advise(&self, resource: ResourceType) -> BTreeSet<MemberId> {
        self.snapshot(resource).sick().clone()
    }

    /// Sick set restricted to members still hosting `region`.
    #[must_use]
    pub fn advise_for_region(&self, resource: ResourceType, region: &str) -> BTreeSet<MemberId> {
        self.snapshot(resource).sick_for_region(region)
    }

    #[must_use]
    pub fn is_sick(&self, resource: ResourceType, member: &MemberId, region: Option<&str>) -> bool {
        self.snapshot(resource).is_sick(member, region)
    }

    #[must_use]
    pub fn profile(&self, resource: ResourceType, member: &MemberId) -> Option<MemberProfile> {
        self.snapshot(resource).profile(member).cloned()
    }

    /// Publish the local monitor's state without a transition, e.g. at
    /// startup, so peers have a profile for this member.
    pub fn announce_local(&self, resource: ResourceType, state: MemoryState, bytes_used: u64, max_bytes: u64) {
        self.on_local_transition(&ResourceEvent {
            resource,
            state,
            previous: state,
            settled: state,
            bytes_used,
            max_bytes,
            member: self.local.clone(),
            origin: EventOrigin::Local,
            timestamp: Utc::now(),
        });
    }

    /// Record a confirmed local transition and broadcast it. Delivery
    /// failures are logged; peers reconcile on the next transition or view
    /// change.
    pub fn on_local_transition(&self, event: &ResourceEvent) {
        let message = {
            let mut announcements = self.local_announcements.lock();
            let sequence = self.local_sequence.fetch_add(1, Ordering::Relaxed) + 1;
            self.update(event.resource, |view| {
                view.profiles.insert(
                    self.local.clone(),
                    MemberProfile {
                        member: self.local.clone(),
                        resource: event.resource,
                        state: event.settled,
                        sequence,
                        timestamp: event.timestamp,
                    },
                );
            });
            let message = AdvisorMessage::StateChanged {
                member: self.local.clone(),
                resource: event.resource,
                state: event.state,
                previous: event.previous,
                settled: event.settled,
                sequence,
                bytes_used: event.bytes_used,
                max_bytes: event.max_bytes,
                timestamp: event.timestamp,
            };
            announcements.insert(event.resource, message.clone());
            message
        };
        self.publish(&message);
    }

    /// Apply a message from a peer.
    ///
    /// Messages from members that already left the view are dropped, as are
    /// state messages not newer than the stored profile.
    pub fn on_receive(&self, message: AdvisorMessage) {
        if *message.member() == self.local || self.departed.lock().contains(message.member()) {
            return;
        }
        match message {
            AdvisorMessage::StateChanged {
                member,
                resource,
                state,
                previous,
                settled,
                sequence,
                bytes_used,
                max_bytes,
                timestamp,
            } => {
                let mut stale = false;
                self.update(resource, |view| {
                    if view.profiles.get(&member).is_some_and(|p| p.sequence >= sequence) {
                        stale = true;
                        return;
                    }
                    view.profiles.insert(
                        member.clone(),
                        MemberProfile {
                            member: member.clone(),
                            resource,
                            state: settled,
                            sequence,
                            timestamp,
                        },
                    );
                });
                if stale {
                    return;
                }
                self.logger.send(ActivityEvent::RemoteStateObserved {
                    member: member.to_string(),
                    resource: resource.to_string(),
                    state: state.to_string(),
                });
                self.registry.dispatch(&ResourceEvent {
                    resource,
                    state,
                    previous,
                    settled,
                    bytes_used,
                    max_bytes,
                    member,
                    origin: EventOrigin::Remote,
                    timestamp,
                });
            }
            AdvisorMessage::Retracted { member, scope } => {
                self.on_resource_retracted(&member, &scope);
            }
            AdvisorMessage::ScopeRestored { member, region } => {
                self.on_scope_restored(&member, &region);
            }
        }
    }

    /// Forget everything about a member that left the view.
    pub fn on_member_departed(&self, member: &MemberId) {
        if *member == self.local {
            return;
        }
        self.departed.lock().insert(member.clone());
        let mut changed = false;
        for resource in ResourceType::ALL {
            self.update(resource, |view| changed |= view.forget(member));
        }
        if changed {
            self.logger.send(ActivityEvent::MemberDeparted {
                member: member.to_string(),
            });
        }
    }

    /// Tell a newcomer what this member currently looks like. A member
    /// joining under a known id starts from a clean profile.
    pub fn on_member_joined(&self, member: &MemberId) {
        self.departed.lock().remove(member);
        for resource in ResourceType::ALL {
            if self.snapshot(resource).knows(member) {
                self.update(resource, |view| {
                    view.forget(member);
                });
            }
        }
        let mut replay: Vec<AdvisorMessage> = self.local_announcements.lock().values().cloned().collect();
        replay.extend(
            self.local_retracted_regions
                .lock()
                .iter()
                .map(|region| AdvisorMessage::Retracted {
                    member: self.local.clone(),
                    scope: RetractionScope::Region(region.clone()),
                }),
        );
        for message in replay {
            if let Err(err) = self.transport.send_to(member, &message) {
                self.log_propagation_failure(&err);
            }
        }
    }

    /// Apply a retraction announced by `member`.
    pub fn on_resource_retracted(&self, member: &MemberId, scope: &RetractionScope) {
        match scope {
            RetractionScope::Member => {
                for resource in ResourceType::ALL {
                    self.update(resource, |view| {
                        view.forget(member);
                    });
                }
            }
            RetractionScope::Resource(resource) => {
                self.update(*resource, |view| {
                    view.profiles.remove(member);
                });
            }
            RetractionScope::Region(region) => {
                for resource in ResourceType::ALL {
                    self.update(resource, |view| {
                        view.region_retractions
                            .entry(member.clone())
                            .or_default()
                            .insert(region.clone());
                    });
                }
            }
        }
        self.logger.send(ActivityEvent::ScopeRetracted {
            member: member.to_string(),
            scope: scope.to_string(),
        });
    }

    /// Reverse a region retraction.
    pub fn on_scope_restored(&self, member: &MemberId, region: &str) {
        for resource in ResourceType::ALL {
            self.update(resource, |view| {
                if let Some(regions) = view.region_retractions.get_mut(member) {
                    regions.remove(region);
                    if regions.is_empty() {
                        view.region_retractions.remove(member);
                    }
                }
            });
        }
        self.logger.send(ActivityEvent::ScopeRestored {
            member: member.to_string(),
            region: region.to_string(),
        });
    }

    /// Retract this member cluster-wide for `scope`.
    pub fn retract_local(&self, scope: RetractionScope) {
        match &scope {
            RetractionScope::Region(region) => {
                self.local_retracted_regions.lock().insert(region.clone());
            }
            RetractionScope::Resource(resource) => {
                self.local_announcements.lock().remove(resource);
            }
            RetractionScope::Member => {
                self.local_announcements.lock().clear();
                self.local_retracted_regions.lock().clear();
            }
        }
        self.on_resource_retracted(&self.local.clone(), &scope);
        self.publish(&AdvisorMessage::Retracted {
            member: self.local.clone(),
            scope,
        });
    }

    /// Undo a local region retraction (the region was re-created here).
    pub fn restore_local_region(&self, region: &str) {
        self.local_retracted_regions.lock().remove(region);
        self.on_scope_restored(&self.local.clone(), region);
        self.publish(&AdvisorMessage::ScopeRestored {
            member: self.local.clone(),
            region: region.to_string(),
        });
    }

    /// Drop every profile whose member is not in `members`.
    pub fn reconcile_view(&self, members: &[MemberId]) {
        let keep: BTreeSet<&MemberId> = members.iter().chain(std::iter::once(&self.local)).collect();
        let mut departed = BTreeSet::new();
        for resource in ResourceType::ALL {
            let outdated = self
                .snapshot(resource)
                .members()
                .any(|m| !keep.contains(m));
            if !outdated {
                continue;
            }
            self.update(resource, |view| {
                let gone: Vec<MemberId> = view
                    .profiles
                    .keys()
                    .chain(view.region_retractions.keys())
                    .filter(|m| !keep.contains(m))
                    .cloned()
                    .collect();
                for member in gone {
                    view.forget(&member);
                    departed.insert(member);
                }
            });
        }
        if !departed.is_empty() {
            self.departed.lock().extend(departed.iter().cloned());
        }
        for member in departed {
            self.logger.send(ActivityEvent::MemberDeparted {
                member: member.to_string(),
            });
        }
    }

    /// Reconcile against the transport's own membership view.
    pub fn refresh_view(&self) {
        self.reconcile_view(&self.transport.members());
    }

    fn publish(&self, message: &AdvisorMessage) {
        if let Err(err) = self.transport.broadcast(message) {
            self.log_propagation_failure(&err);
        }
    }

    fn log_propagation_failure(&self, err: &GridError) {
        let member = match err {
            GridError::Propagation { member, .. } => member.to_string(),
            _ => self.local.to_string(),
        };
        self.logger.send(ActivityEvent::PropagationFailed {
            member,
            error_code: err.code().to_string(),
            error_message: err.to_string(),
        });
    }

    /// Copy-on-write update of one resource view.
    fn update<F>(&self, resource: ResourceType, mutate: F)
    where
        F: FnOnce(&mut ResourceView),
    {
        let Some(slot) = self.views.get(&resource) else {
            return;
        };
        let mut guard = slot.write();
        let mut next = ResourceView::clone(&guard);
        mutate(&mut next);
        next.recompute();
        *guard = Arc::new(next);
    }
}

impl TransitionSink for ClusterAdvisor {
    fn on_transition(&self, event: &ResourceEvent) {
        self.on_local_transition(event);
    }
}

impl MessageHandler for ClusterAdvisor {
    fn handle_message(&self, message: AdvisorMessage) {
        self.on_receive(message);
    }

    fn member_joined(&self, member: &MemberId) {
        self.on_member_joined(member);
    }

    fn member_departed(&self, member: &MemberId) {
        self.on_member_departed(member);
    }
}

impl std::fmt::Debug for ClusterAdvisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAdvisor")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Join `advisor` to its transport so inbound traffic reaches it.
pub fn join_cluster(advisor: &Arc<ClusterAdvisor>) -> Result<()> {
    advisor.transport.join(Arc::clone(advisor) as Arc<dyn MessageHandler>)
}

/// Leave the transport; remaining members drop this member's profiles.
pub fn leave_cluster(advisor: &ClusterAdvisor) {
    advisor.transport.leave();
}
