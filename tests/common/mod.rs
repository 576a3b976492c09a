#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gridguard::cluster::member::MemberId;
use gridguard::cluster::transport::LoopbackNetwork;
use gridguard::core::config::{ClusterConfig, Config};
use gridguard::core::errors::Result;
use gridguard::daemon::manager::{ResourceManager, Samplers};
use gridguard::logger::activity::ActivityLoggerHandle;
use gridguard::monitor::sampler::{FakeSampler, MemorySampler};
use gridguard::resource::events::ResourceType;

// ──────────────────── CLI harness ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_gridguard") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "gridguard.exe" } else { "gridguard" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve gridguard binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("gridguard-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env_remove("GRIDGUARD_MEMBER_ID")
        .output()
        .expect("execute gridguard command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── in-process cluster ────────────────────

pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONVERGENCE_POLL: Duration = Duration::from_millis(5);

/// Config with heap and off-heap thresholds set and test convergence timing.
pub fn config(eviction_percent: f64, critical_percent: f64, tolerance: u32) -> Config {
    let mut config = Config::default();
    config.cluster = ClusterConfig {
        convergence_timeout_ms: u64::try_from(CONVERGENCE_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
        convergence_poll_ms: u64::try_from(CONVERGENCE_POLL.as_millis()).unwrap_or(u64::MAX),
    };
    config.heap.eviction_percent = eviction_percent;
    config.heap.critical_percent = critical_percent;
    config.heap.tolerance = tolerance;
    config.off_heap = config.heap.clone();
    config
}

pub struct TestMember {
    pub manager: ResourceManager,
    pub heap: Arc<FakeSampler>,
    pub off_heap: Arc<FakeSampler>,
}

impl TestMember {
    pub fn id(&self) -> &MemberId {
        self.manager.member()
    }

    /// Set heap usage (out of 1000) and take one sample.
    pub fn set_heap(&self, bytes_used: u64) {
        self.heap.set_bytes_used(bytes_used);
        let _ = self
            .manager
            .monitor(ResourceType::HeapMemory)
            .expect("heap monitor")
            .sample_now();
    }
}

/// Members on one loopback network, each with fake heap and off-heap
/// samplers reporting a maximum of 1000 bytes.
pub struct TestCluster {
    pub network: Arc<LoopbackNetwork>,
    pub members: Vec<TestMember>,
    config: Config,
}

impl TestCluster {
    pub fn start(names: &[&str], config: Config) -> Self {
        let mut cluster = Self {
            network: LoopbackNetwork::new(),
            members: Vec::new(),
            config,
        };
        for name in names {
            cluster.add_member(name).expect("start member");
        }
        cluster
    }

    pub fn add_member(&mut self, name: &str) -> Result<&TestMember> {
        let heap = Arc::new(FakeSampler::new(0, 1000));
        let off_heap = Arc::new(FakeSampler::new(0, 1000));
        let manager = ResourceManager::start(
            self.config.clone(),
            Arc::new(self.network.endpoint(MemberId::from(name))),
            Samplers::heap(Arc::clone(&heap) as Arc<dyn MemorySampler>)
                .with_off_heap(Arc::clone(&off_heap) as Arc<dyn MemorySampler>),
            ActivityLoggerHandle::detached(),
        )?;
        self.members.push(TestMember {
            manager,
            heap,
            off_heap,
        });
        Ok(self.members.last().expect("just pushed"))
    }

    pub fn member(&self, name: &str) -> &TestMember {
        self.members
            .iter()
            .find(|m| m.id().as_str() == name)
            .unwrap_or_else(|| panic!("no member {name}"))
    }

    /// Remove a member from the fixture without closing it.
    pub fn take(&mut self, name: &str) -> TestMember {
        let idx = self
            .members
            .iter()
            .position(|m| m.id().as_str() == name)
            .unwrap_or_else(|| panic!("no member {name}"));
        self.members.remove(idx)
    }

    /// Wait until every listed observer sees exactly `expected` as the sick set.
    pub fn await_sick(&self, observers: &[&str], resource: ResourceType, expected: &[&str]) {
        let expected: BTreeSet<MemberId> = expected.iter().map(|s| MemberId::from(*s)).collect();
        for observer in observers {
            let manager = &self.member(observer).manager;
            let advisor = manager.advisor();
            manager
                .await_cluster(&format!("{observer} sees sick set {expected:?}"), || {
                    advisor.advise(resource) == expected
                })
                .unwrap_or_else(|e| panic!("{e}; actual {:?}", advisor.advise(resource)));
        }
    }

    /// Wait until every member has a profile for every other member.
    pub fn await_full_view(&self) {
        for observer in &self.members {
            for peer in &self.members {
                let advisor = observer.manager.advisor();
                observer
                    .manager
                    .await_cluster(&format!("{} knows {}", observer.id(), peer.id()), || {
                        advisor.profile(ResourceType::HeapMemory, peer.id()).is_some()
                    })
                    .expect("view converged");
            }
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for member in &self.members {
            member.manager.close("test teardown");
        }
        self.network.shutdown();
    }
}
