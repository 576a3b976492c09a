//! Data region: the write, load and execute paths that consult the
//! admission guard on every call.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::admission::guard::{AdmissionGuard, ExecutionProfile, ExecutionTargets};
use crate::cluster::member::MemberId;
use crate::core::errors::Result;
use crate::resource::events::ResourceType;

/// Maps a key to the member that owns it.
pub trait PartitionResolver<K>: Send + Sync {
    fn owner(&self, key: &K) -> MemberId;
}

impl<K, F> PartitionResolver<K> for F
where
    F: Fn(&K) -> MemberId + Send + Sync,
{
    fn owner(&self, key: &K) -> MemberId {
        self(key)
    }
}

/// Every key is owned by one member, as in a replicated region.
#[derive(Debug, Clone)]
pub struct LocalOwner(pub MemberId);

impl<K> PartitionResolver<K> for LocalOwner {
    fn owner(&self, _key: &K) -> MemberId {
        self.0.clone()
    }
}

pub struct Region<K, V> {
    name: String,
    guard: Arc<AdmissionGuard>,
    resolver: Arc<dyn PartitionResolver<K>>,
    /// Resources whose pressure gates this region.
    resources: Vec<ResourceType>,
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Region<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Replicated region gated on heap memory: the local member owns every key.
    #[must_use]
    pub fn replicated(name: impl Into<String>, guard: Arc<AdmissionGuard>) -> Self {
        let owner = LocalOwner(guard.local_member().clone());
        Self::partitioned(name, guard, Arc::new(owner))
    }

    /// Partitioned region gated on heap memory.
    #[must_use]
    pub fn partitioned(name: impl Into<String>, guard: Arc<AdmissionGuard>, resolver: Arc<dyn PartitionResolver<K>>) -> Self {
        Self {
            name: name.into(),
            guard,
            resolver,
            resources: vec![ResourceType::HeapMemory],
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Also gate on off-heap memory (or any other set of resources).
    #[must_use]
    pub fn with_resources(mut self, resources: impl IntoIterator<Item = ResourceType>) -> Self {
        self.resources = resources.into_iter().collect();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn owner_of(&self, key: &K) -> MemberId {
        self.resolver.owner(key)
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let owner = self.resolver.owner(&key);
        for resource in &self.resources {
            self.guard.check_write(*resource, Some(&self.name), Some(&owner))?;
        }
        Ok(self.entries.write().insert(key, value))
    }

    /// All-or-nothing batch: if any key's owner is sick, nothing is stored.
    pub fn put_all(&self, batch: Vec<(K, V)>) -> Result<()> {
        let owners: BTreeSet<MemberId> = batch.iter().map(|(k, _)| self.resolver.owner(k)).collect();
        for resource in &self.resources {
            self.guard.check_write_all(*resource, Some(&self.name), owners.iter())?;
        }
        self.entries.write().extend(batch);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Read-through. A miss always calls `loader`; the result is stored
    /// only when no gating resource asks to suppress caching.
    pub fn get_or_load<F>(&self, key: &K, loader: F) -> Result<V>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let suppress_caching = self
            .resources
            .iter()
            .any(|r| self.guard.check_load(*r).suppress_caching);
        let loaded = loader(key)?;
        if suppress_caching {
            return Ok(loaded);
        }
        let mut entries = self.entries.write();
        Ok(entries.entry(key.clone()).or_insert(loaded).clone())
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Removal frees memory and is never gated.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Data-aware execution over `filter` keys. An empty filter targets
    /// every member hosting the region.
    pub fn execute_on<R, F>(&self, filter: &[K], profile: ExecutionProfile, function: F) -> Result<R>
    where
        F: FnOnce(&Self, &[K]) -> Result<R>,
    {
        let owners: BTreeSet<MemberId> = filter.iter().map(|k| self.resolver.owner(k)).collect();
        let targets = if filter.is_empty() {
            ExecutionTargets::All
        } else {
            ExecutionTargets::Members(&owners)
        };
        for resource in &self.resources {
            self.guard.check_execute(*resource, Some(&self.name), targets, profile)?;
        }
        function(self, filter)
    }
}

impl<K, V> std::fmt::Debug for Region<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::advisor::ClusterAdvisor;
    use crate::cluster::message::AdvisorMessage;
    use crate::cluster::transport::LoopbackNetwork;
    use crate::core::errors::GridError;
    use crate::logger::activity::ActivityLoggerHandle;
    use crate::monitor::thresholds::MemoryState;
    use crate::resource::registry::ResourceRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup() -> (Arc<ClusterAdvisor>, Arc<AdmissionGuard>) {
        let net = LoopbackNetwork::new();
        let advisor = Arc::new(ClusterAdvisor::new(
            Arc::new(net.endpoint(MemberId::from("a"))),
            Arc::new(ResourceRegistry::new(ActivityLoggerHandle::detached())),
            ActivityLoggerHandle::detached(),
        ));
        let guard = Arc::new(AdmissionGuard::new(Arc::clone(&advisor), ActivityLoggerHandle::detached()));
        (advisor, guard)
    }

    static SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

    fn set_state(advisor: &ClusterAdvisor, member: &str, state: MemoryState) {
        if member == advisor.local_member().as_str() {
            advisor.announce_local(ResourceType::HeapMemory, state, 0, 0);
            return;
        }
        advisor.on_receive(AdvisorMessage::StateChanged {
            member: MemberId::from(member),
            resource: ResourceType::HeapMemory,
            state,
            previous: MemoryState::Normal,
            settled: state,
            sequence: SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            bytes_used: 0,
            max_bytes: 0,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Even keys on "a", odd keys on "b".
    fn by_parity(key: &u32) -> MemberId {
        if key % 2 == 0 { MemberId::from("a") } else { MemberId::from("b") }
    }

    #[test]
    fn put_is_rejected_only_for_keys_owned_by_sick_members() {
        let (advisor, guard) = setup();
        let region: Region<u32, String> = Region::partitioned("orders", guard, Arc::new(by_parity));
        set_state(&advisor, "b", MemoryState::Critical);

        assert!(region.put(2, "two".to_string()).is_ok());
        let err = region.put(3, "three".to_string()).unwrap_err();
        assert!(matches!(err, GridError::ResourceRejected(_)));
        assert!(!region.contains_key(&3));
    }

    #[test]
    fn put_all_is_atomic() {
        let (advisor, guard) = setup();
        let region: Region<u32, u32> = Region::partitioned("orders", guard, Arc::new(by_parity));
        set_state(&advisor, "b", MemoryState::Critical);

        let err = region.put_all(vec![(2, 2), (4, 4), (5, 5)]).unwrap_err();
        assert_eq!(err.rejection().unwrap().members.len(), 1);
        assert!(region.is_empty());

        region.put_all(vec![(2, 2), (4, 4)]).unwrap();
        assert_eq!(region.len(), 2);
    }

    #[test]
    fn loader_passes_through_while_critical_and_caches_after() {
        let (advisor, guard) = setup();
        let region: Region<&'static str, u32> = Region::replicated("lookup", guard);
        let calls = AtomicU32::new(0);
        let loader = |_: &&'static str| -> Result<u32> {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(42)
        };

        set_state(&advisor, "a", MemoryState::Critical);
        for _ in 0..3 {
            assert_eq!(region.get_or_load(&"k", loader).unwrap(), 42);
            assert!(!region.contains_key(&"k"));
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        set_state(&advisor, "a", MemoryState::Normal);
        assert_eq!(region.get_or_load(&"k", loader).unwrap(), 42);
        assert!(region.contains_key(&"k"));
        assert_eq!(calls.load(Ordering::Relaxed), 4);

        assert_eq!(region.get_or_load(&"k", loader).unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn loader_failure_is_returned_and_nothing_is_cached() {
        let (_advisor, guard) = setup();
        let region: Region<u32, u32> = Region::replicated("lookup", guard);
        let err = region
            .get_or_load(&1, |_| {
                Err(GridError::Runtime {
                    details: "backend down".to_string(),
                })
            })
            .unwrap_err();
        assert_eq!(err.code(), "GG-3900");
        assert!(!region.contains_key(&1));
    }

    #[test]
    fn execute_on_checks_owners_of_filter_keys() {
        let (advisor, guard) = setup();
        let region: Region<u32, u32> = Region::partitioned("orders", guard, Arc::new(by_parity));
        region.put_all(vec![(2, 20), (3, 30)]).unwrap();
        set_state(&advisor, "b", MemoryState::Critical);

        let sum = region
            .execute_on(&[2], ExecutionProfile::default(), |r, keys| {
                Ok(keys.iter().filter_map(|k| r.get(k)).sum::<u32>())
            })
            .unwrap();
        assert_eq!(sum, 20);

        assert!(region
            .execute_on(&[2, 3], ExecutionProfile::default(), |_, _| Ok(()))
            .is_err());
        assert!(region.execute_on(&[], ExecutionProfile::default(), |_, _| Ok(())).is_err());
        assert!(region
            .execute_on(&[3], ExecutionProfile::read_only(), |_, _| Ok(()))
            .is_ok());
    }

    #[test]
    fn remove_is_never_gated() {
        let (advisor, guard) = setup();
        let region: Region<u32, u32> = Region::replicated("lookup", guard);
        region.put(1, 1).unwrap();
        set_state(&advisor, "a", MemoryState::Critical);
        assert_eq!(region.remove(&1), Some(1));
        assert!(region.put(1, 1).is_err());
    }
}
