//! Admission guard: the synchronous accept/reject decision for data paths.
//!
//! Every check reads one advisor snapshot and returns immediately. Nothing
//! here blocks, waits for convergence, or retries.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::advisor::{ClusterAdvisor, ResourceView};
use crate::cluster::member::MemberId;
use crate::core::errors::{GridError, LowMemory, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::resource::events::ResourceType;

/// Outcome of a load-path check. Loads are never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadAdmission {
    /// Return the loaded value but do not store it.
    pub suppress_caching: bool,
}

/// How a function declares its sensitivity to memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    /// `false` marks a function that does not grow memory; it is always admitted.
    pub optimize_for_write: bool,
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self {
            optimize_for_write: true,
        }
    }
}

impl ExecutionProfile {
    /// Profile for functions that should run regardless of memory state.
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            optimize_for_write: false,
        }
    }
}

/// Which members an execution touches.
#[derive(Debug, Clone, Copy)]
pub enum ExecutionTargets<'a> {
    /// Exactly these members.
    Members(&'a BTreeSet<MemberId>),
    /// Every member hosting the data in scope.
    All,
}

pub struct AdmissionGuard {
    advisor: Arc<ClusterAdvisor>,
    logger: ActivityLoggerHandle,
}

impl AdmissionGuard {
    #[must_use]
    pub const fn new(advisor: Arc<ClusterAdvisor>, logger: ActivityLoggerHandle) -> Self {
        Self { advisor, logger }
    }

    #[must_use]
    pub fn local_member(&self) -> &MemberId {
        self.advisor.local_member()
    }

    /// Reject when `owner` (the local member when `None`) is sick.
    pub fn check_write(&self, resource: ResourceType, region: Option<&str>, owner: Option<&MemberId>) -> Result<()> {
        let owner = owner.unwrap_or_else(|| self.advisor.local_member());
        self.check_write_all(resource, region, std::iter::once(owner))
    }

    /// Bulk form: one sick owner rejects the whole batch, naming every sick
    /// owner found.
    pub fn check_write_all<'a, I>(&self, resource: ResourceType, region: Option<&str>, owners: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a MemberId>,
    {
        let view = self.advisor.snapshot(resource);
        if view.sick().is_empty() {
            return Ok(());
        }
        let sick: BTreeSet<MemberId> = owners
            .into_iter()
            .filter(|m| view.is_sick(m, region))
            .cloned()
            .collect();
        self.verdict(resource, region, sick, "write")
    }

    /// Load-path check: never rejects, but asks the caller not to cache
    /// while the local member is sick.
    #[must_use]
    pub fn check_load(&self, resource: ResourceType) -> LoadAdmission {
        LoadAdmission {
            suppress_caching: self
                .advisor
                .snapshot(resource)
                .is_sick(self.advisor.local_member(), None),
        }
    }

    /// Reject when any targeted member is sick, unless the function opted
    /// out of memory sensitivity.
    pub fn check_execute(
        &self,
        resource: ResourceType,
        region: Option<&str>,
        targets: ExecutionTargets<'_>,
        profile: ExecutionProfile,
    ) -> Result<()> {
        if !profile.optimize_for_write {
            return Ok(());
        }
        let view = self.advisor.snapshot(resource);
        let sick = match targets {
            ExecutionTargets::Members(members) => members
                .iter()
                .filter(|m| view.is_sick(m, region))
                .cloned()
                .collect(),
            ExecutionTargets::All => sick_in_scope(&view, region),
        };
        self.verdict(resource, region, sick, "execute")
    }

    fn verdict(&self, resource: ResourceType, region: Option<&str>, sick: BTreeSet<MemberId>, operation: &str) -> Result<()> {
        if sick.is_empty() {
            return Ok(());
        }
        self.logger.send(ActivityEvent::OperationRejected {
            resource: resource.to_string(),
            operation: operation.to_string(),
            region: region.map(str::to_string),
            members: sick.iter().map(ToString::to_string).collect(),
        });
        Err(GridError::ResourceRejected(LowMemory {
            resource,
            members: sick,
            region: region.map(str::to_string),
        }))
    }
}

impl std::fmt::Debug for AdmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGuard")
            .field("local", self.advisor.local_member())
            .finish_non_exhaustive()
    }
}

fn sick_in_scope(view: &ResourceView, region: Option<&str>) -> BTreeSet<MemberId> {
    match region {
        Some(region) => view.sick_for_region(region),
        None => view.sick().clone(),
    }
}
