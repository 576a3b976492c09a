//! Integration tests: CLI smoke tests and multi-member admission scenarios
//! on an in-process cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gridguard::admission::guard::ExecutionProfile;
use gridguard::admission::region::Region;
use gridguard::cluster::convergence::await_convergence;
use gridguard::cluster::member::MemberId;
use gridguard::cluster::message::RetractionScope;
use gridguard::core::errors::{GridError, Result};
use gridguard::monitor::thresholds::MemoryState;
use gridguard::resource::events::{EventOrigin, ResourceEvent, ResourceType};
use gridguard::resource::registry::ResourceListener;

use common::{CONVERGENCE_POLL, CONVERGENCE_TIMEOUT, TestCluster, config};

// ──────────────────── helpers ────────────────────

/// Listener that records `(state, origin, member)` for every event.
fn recorder() -> (Arc<dyn ResourceListener>, Arc<Mutex<Vec<(MemoryState, EventOrigin, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Arc<dyn ResourceListener> = Arc::new(move |event: &ResourceEvent| -> Result<()> {
        sink.lock()
            .push((event.state, event.origin, event.member.to_string()));
        Ok(())
    });
    (listener, seen)
}

/// Even keys live on "a", odd keys on "b".
fn by_parity(key: &u32) -> MemberId {
    if key % 2 == 0 {
        MemberId::from("a")
    } else {
        MemberId::from("b")
    }
}

fn partitioned(cluster: &TestCluster, on: &str, name: &str) -> Region<u32, String> {
    Region::partitioned(
        name,
        Arc::clone(cluster.member(on).manager.guard()),
        Arc::new(by_parity),
    )
}

fn wait_for<F: FnMut() -> bool>(what: &str, condition: F) {
    await_convergence(what, CONVERGENCE_TIMEOUT, CONVERGENCE_POLL, condition)
        .unwrap_or_else(|e| panic!("{e}"));
}

// ──────────────────── CLI ────────────────────

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: gridguard [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(
        result.stdout.contains(env!("CARGO_PKG_VERSION")),
        "log: {}",
        result.log_path.display()
    );
}

#[test]
fn check_config_reports_hash_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gridguard.toml");
    std::fs::write(
        &path,
        "[member]\nid = \"server-7\"\n\n[heap]\neviction_percent = 80.0\ncritical_percent = 90.0\ntolerance = 2\n",
    )
    .unwrap();

    let result = common::run_cli_case(
        "check_config_reports_hash_as_json",
        &["--json", "--config", path.to_str().unwrap(), "check-config"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload: serde_json::Value = serde_json::from_str(result.stdout.trim()).unwrap();
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["member"], "server-7");
    assert_eq!(payload["config"]["heap"]["critical_percent"], 90.0);
    assert!(payload["hash"].as_str().is_some_and(|h| !h.is_empty()));
}

#[test]
fn check_config_rejects_critical_below_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gridguard.toml");
    std::fs::write(&path, "[heap]\neviction_percent = 90.0\ncritical_percent = 80.0\n").unwrap();

    let result = common::run_cli_case(
        "check_config_rejects_critical_below_eviction",
        &["--config", path.to_str().unwrap(), "check-config"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("GG-1001"), "log: {}", result.log_path.display());
}

// ──────────────────── event delivery ────────────────────

#[test]
fn multi_boundary_sample_reaches_local_and_remote_listeners_in_order() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let (local, local_seen) = recorder();
    let (remote, remote_seen) = recorder();
    cluster
        .member("a")
        .manager
        .registry()
        .add_listener(ResourceType::HeapMemory, local);
    cluster
        .member("b")
        .manager
        .registry()
        .add_listener(ResourceType::HeapMemory, remote);

    cluster.member("a").set_heap(950);

    assert_eq!(
        *local_seen.lock(),
        vec![
            (MemoryState::Eviction, EventOrigin::Local, "a".to_string()),
            (MemoryState::Critical, EventOrigin::Local, "a".to_string()),
        ]
    );
    wait_for("b hears both transitions", || remote_seen.lock().len() >= 2);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(
        *remote_seen.lock(),
        vec![
            (MemoryState::Eviction, EventOrigin::Remote, "a".to_string()),
            (MemoryState::Critical, EventOrigin::Remote, "a".to_string()),
        ]
    );

    let stats = cluster.member("b").manager.registry().stats(ResourceType::HeapMemory);
    assert_eq!(stats.remote_count(MemoryState::Critical), 1);
    assert_eq!(stats.local_count(MemoryState::Critical), 0);
}

#[test]
fn resource_types_are_independent() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let a = cluster.member("a");
    a.off_heap.set_bytes_used(990);
    a.manager
        .monitor(ResourceType::OffHeapMemory)
        .unwrap()
        .sample_now()
        .unwrap();

    cluster.await_sick(&["a", "b"], ResourceType::OffHeapMemory, &["a"]);
    cluster.await_sick(&["a", "b"], ResourceType::HeapMemory, &[]);
}

// ──────────────────── write admission ────────────────────

#[test]
fn writes_to_sick_owner_are_rejected_and_batches_are_atomic() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let orders = partitioned(&cluster, "a", "orders");

    cluster.member("b").set_heap(950);
    cluster.await_sick(&["a", "b"], ResourceType::HeapMemory, &["b"]);

    let err = orders.put(3, "three".to_string()).unwrap_err();
    let low = err.rejection().expect("resource rejection");
    assert_eq!(low.resource, ResourceType::HeapMemory);
    assert!(low.members.contains(&MemberId::from("b")));
    assert_eq!(low.region.as_deref(), Some("orders"));
    assert!(!err.is_retryable());

    let batch = vec![(2, "two".to_string()), (4, "four".to_string()), (5, "five".to_string())];
    assert!(orders.put_all(batch).unwrap_err().is_resource_rejected());
    assert!(orders.is_empty());

    orders.put(2, "two".to_string()).unwrap();
    orders
        .put_all(vec![(4, "four".to_string()), (6, "six".to_string())])
        .unwrap();
    assert_eq!(orders.len(), 3);
}

#[test]
fn rejection_survives_remote_envelope() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    cluster.member("b").set_heap(990);
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);

    // A client sees the server's failure wrapped for transport.
    let server_side = partitioned(&cluster, "a", "orders")
        .put(7, "x".to_string())
        .unwrap_err();
    let client_side = GridError::remote("put", server_side);

    assert_eq!(client_side.code(), "GG-2102");
    let cause = std::error::Error::source(&client_side).expect("cause kept");
    assert!(cause.to_string().starts_with("[GG-2101]"));
    assert!(client_side.rejection().unwrap().members.contains(&MemberId::from("b")));
}

#[test]
fn execution_rejects_sick_targets_unless_not_write_optimized() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let orders = partitioned(&cluster, "a", "orders");
    cluster.member("b").set_heap(950);
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);

    assert!(orders.execute_on(&[2, 4], ExecutionProfile::default(), |_, keys| Ok(keys.len())).is_ok());
    assert!(orders.execute_on(&[3], ExecutionProfile::default(), |_, _| Ok(())).is_err());
    assert!(orders.execute_on(&[], ExecutionProfile::default(), |_, _| Ok(())).is_err());
    assert!(orders.execute_on(&[3], ExecutionProfile::read_only(), |_, _| Ok(())).is_ok());
}

// ──────────────────── loads ────────────────────

#[test]
fn loader_passes_through_while_critical() {
    let cluster = TestCluster::start(&["a"], config(80.0, 90.0, 0));
    let a = cluster.member("a");
    let lookup: Region<String, u64> = a.manager.region("lookup");
    let calls = Mutex::new(0_u32);
    let loader = |key: &String| -> Result<u64> {
        *calls.lock() += 1;
        Ok(key.len() as u64)
    };
    let key = "unknown-key".to_string();

    a.set_heap(950);
    for _ in 0..3 {
        assert_eq!(lookup.get_or_load(&key, loader).unwrap(), 11);
        assert!(!lookup.contains_key(&key));
    }
    assert_eq!(*calls.lock(), 3);

    a.set_heap(100);
    assert_eq!(a.manager.monitor(ResourceType::HeapMemory).unwrap().state(), MemoryState::Normal);
    assert_eq!(lookup.get_or_load(&key, loader).unwrap(), 11);
    assert!(lookup.contains_key(&key));
    assert_eq!(*calls.lock(), 4);
}

// ──────────────────── departure and retraction ────────────────────

#[test]
fn crashed_sick_member_is_dropped_by_every_peer() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let orders = partitioned(&cluster, "a", "orders");
    cluster.member("b").set_heap(950);
    cluster.await_sick(&["a", "c"], ResourceType::HeapMemory, &["b"]);
    assert!(orders.put(1, "one".to_string()).is_err());

    let crashed = cluster.take("b");
    cluster.network.crash(crashed.id());

    cluster.await_sick(&["a", "c"], ResourceType::HeapMemory, &[]);
    orders.put(1, "one".to_string()).unwrap();
}

#[test]
fn crashed_member_stays_gone_despite_late_state_messages() {
    let mut cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let crashed = cluster.take("b");
    cluster.network.crash(crashed.id());
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &[]);

    // The crashed process still thinks it is joined and keeps broadcasting.
    crashed.set_heap(950);
    std::thread::sleep(Duration::from_millis(50));

    let a = cluster.member("a");
    assert!(a.manager.advisor().advise(ResourceType::HeapMemory).is_empty());
    assert!(a.manager.advisor().profile(ResourceType::HeapMemory, crashed.id()).is_none());
    let orders: Region<u32, String> = a.manager.region("orders");
    assert!(orders.execute_on(&[], ExecutionProfile::default(), |_, _| Ok(())).is_ok());
}

#[test]
fn gracefully_closed_sick_member_is_dropped_by_every_peer() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    cluster.member("b").set_heap(950);
    cluster.await_sick(&["a", "c"], ResourceType::HeapMemory, &["b"]);

    let closing = cluster.take("b");
    closing.manager.close("rolling restart");

    cluster.await_sick(&["a", "c"], ResourceType::HeapMemory, &[]);
    for observer in ["a", "c"] {
        assert!(
            cluster
                .member(observer)
                .manager
                .advisor()
                .profile(ResourceType::HeapMemory, closing.id())
                .is_none()
        );
    }
    assert!(partitioned(&cluster, "a", "orders").put(1, "one".to_string()).is_ok());
}

#[test]
fn region_retraction_readmits_only_that_region() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let orders = partitioned(&cluster, "a", "orders");
    let items = partitioned(&cluster, "a", "items");
    cluster.member("b").set_heap(950);
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);

    cluster
        .member("b")
        .manager
        .advisor()
        .retract_local(RetractionScope::Region("orders".to_string()));
    let advisor = cluster.member("a").manager.advisor();
    wait_for("a excludes b from orders", || {
        advisor.advise_for_region(ResourceType::HeapMemory, "orders").is_empty()
    });

    orders.put(1, "one".to_string()).unwrap();
    assert!(items.put(1, "one".to_string()).is_err());

    cluster.member("b").manager.advisor().restore_local_region("orders");
    wait_for("a counts b for orders again", || {
        !advisor.advise_for_region(ResourceType::HeapMemory, "orders").is_empty()
    });
    assert!(orders.put(3, "three".to_string()).is_err());
}

#[test]
fn late_joiner_learns_existing_sick_member() {
    let mut cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    cluster.member("b").set_heap(950);
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);

    cluster.add_member("c").unwrap();
    cluster.await_sick(&["c"], ResourceType::HeapMemory, &["b"]);
}

#[test]
fn partitioned_peer_catches_up_on_next_transition() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let a_id = MemberId::from("a");

    cluster.network.set_partitioned(&a_id, true);
    cluster.member("b").set_heap(950);
    std::thread::sleep(Duration::from_millis(20));
    assert!(cluster.member("a").manager.advisor().advise(ResourceType::HeapMemory).is_empty());

    cluster.network.set_partitioned(&a_id, false);
    cluster.member("b").set_heap(800);
    cluster.member("b").set_heap(960);
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);
}

// ──────────────────── runtime reconfiguration ────────────────────

#[test]
fn disabling_critical_axis_fires_once_and_stops_rejecting() {
    let cluster = TestCluster::start(&["a", "b"], config(80.0, 90.0, 0));
    cluster.await_full_view();
    let b = cluster.member("b");
    let (listener, seen) = recorder();
    b.manager.registry().add_listener(ResourceType::HeapMemory, listener);

    b.set_heap(950);
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);

    b.manager
        .registry()
        .set_critical_percent(ResourceType::HeapMemory, 0.0)
        .unwrap();
    b.set_heap(999);
    b.set_heap(999);

    let disabled = seen
        .lock()
        .iter()
        .filter(|(state, _, _)| *state == MemoryState::CriticalDisabled)
        .count();
    assert_eq!(disabled, 1);

    cluster.await_sick(&["a", "b"], ResourceType::HeapMemory, &[]);
    assert!(partitioned(&cluster, "a", "orders").put(1, "one".to_string()).is_ok());

    b.manager
        .registry()
        .set_critical_percent(ResourceType::HeapMemory, 90.0)
        .unwrap();
    cluster.await_sick(&["a"], ResourceType::HeapMemory, &["b"]);
}

#[test]
fn invalid_runtime_percent_is_rejected_without_side_effects() {
    let cluster = TestCluster::start(&["a"], config(80.0, 90.0, 0));
    let registry = cluster.member("a").manager.registry();

    assert!(registry.set_critical_percent(ResourceType::HeapMemory, 120.0).is_err());
    assert!(registry.set_critical_percent(ResourceType::HeapMemory, 70.0).is_err());
    assert!(registry.set_eviction_percent(ResourceType::HeapMemory, -1.0).is_err());
    assert_eq!(registry.critical_percent(ResourceType::HeapMemory).unwrap(), 90.0);
    assert_eq!(registry.eviction_percent(ResourceType::HeapMemory).unwrap(), 80.0);
}

#[test]
fn hysteresis_holds_escalation_but_not_recovery() {
    let mut config = config(94.0, 95.0, 3);
    config.heap.max_bytes = Some(100);
    let cluster = TestCluster::start(&["a"], config);
    let a = cluster.member("a");
    let monitor = a.manager.monitor(ResourceType::HeapMemory).unwrap();

    for expected in [
        MemoryState::Normal,
        MemoryState::Normal,
        MemoryState::Normal,
        MemoryState::Critical,
    ] {
        a.set_heap(96);
        assert_eq!(monitor.state(), expected);
    }
    a.set_heap(92);
    assert_eq!(monitor.state(), MemoryState::Normal);
}
