//! Node runner: one member process with its logger, resource manager,
//! sampling threads and signal-driven lifecycle.
//!
//! Threads:
//! - **Main**: polls signal flags, applies threshold reloads, owns shutdown.
//! - **Sampler** (one per resource): see [`crate::daemon::sampling`].
//! - **Delivery**: the transport's callback thread for inbound peer messages.
//! - **Logger**: writes JSONL activity.

#![allow(missing_docs)]

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cluster::transport::{LoopbackNetwork, Transport};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::manager::{ResourceManager, Samplers};
use crate::daemon::sampling::SamplingLoop;
use crate::daemon::signals::{ShutdownCoordinator, SignalHandler};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
use crate::logger::jsonl::JsonlConfig;

/// How often the main thread checks signal flags.
const SIGNAL_POLL: Duration = Duration::from_millis(100);

pub struct NodeDaemon {
    config: Config,
    /// Reload source; `None` re-reads the default path.
    config_path: Option<PathBuf>,
    network: Arc<LoopbackNetwork>,
    manager: ResourceManager,
    logger: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signals: SignalHandler,
}

impl NodeDaemon {
    /// Build a single-member node on an in-process network.
    pub fn init(config: Config, signals: SignalHandler) -> Result<Self> {
        config.validate()?;
        let (logger, logger_join) = spawn_logger(
            JsonlConfig::from(&config.logging),
            config.logging.channel_capacity,
        )?;

        let network = LoopbackNetwork::new();
        let endpoint: Arc<dyn Transport> = Arc::new(network.endpoint(config.member_id()));
        let manager = match ResourceManager::start(config.clone(), endpoint, Samplers::default(), logger.clone()) {
            Ok(manager) => manager,
            Err(err) => {
                logger.shutdown();
                let _ = logger_join.join();
                network.shutdown();
                return Err(err);
            }
        };

        Ok(Self {
            config_path: config.source_path.clone(),
            config,
            network,
            manager,
            logger,
            logger_join: Some(logger_join),
            signals,
        })
    }

    #[must_use]
    pub const fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    /// Sample and serve until a shutdown signal arrives.
    pub fn run(mut self) -> Result<()> {
        let sampling = SamplingLoop::spawn(
            self.manager.monitors().cloned(),
            Duration::from_millis(self.config.sampling.poll_interval_ms),
        )?;
        eprintln!(
            "[GG-DAEMON] member {} sampling {} resource(s) every {}ms",
            self.manager.member(),
            sampling.thread_count(),
            self.config.sampling.poll_interval_ms
        );

        loop {
            if self.signals.should_shutdown() {
                eprintln!("[GG-DAEMON] shutdown requested");
                break;
            }
            if self.signals.should_reload() {
                self.handle_config_reload();
            }
            // Drop profiles of members the transport no longer lists, in
            // case a departure notice was missed.
            self.manager.advisor().refresh_view();
            thread::sleep(SIGNAL_POLL);
        }

        self.shutdown(sampling);
        Ok(())
    }

    fn handle_config_reload(&mut self) {
        eprintln!("[GG-DAEMON] threshold reload requested (SIGHUP)");
        let reloaded = Config::load(self.config_path.as_deref()).and_then(|new_config| {
            let old_hash = self.config.stable_hash().unwrap_or_default();
            let new_hash = new_config.stable_hash().unwrap_or_default();
            if old_hash == new_hash {
                eprintln!("[GG-DAEMON] config unchanged, skipping reload");
                return Ok(());
            }
            self.manager.apply_thresholds(&new_config)?;
            self.logger.send(ActivityEvent::ThresholdChanged {
                resource: "all".to_string(),
                details: format!("config hash: {old_hash} -> {new_hash}"),
            });
            self.config = new_config;
            Ok(())
        });
        if let Err(e) = reloaded {
            eprintln!("[GG-DAEMON] config reload failed: {e}");
        }
    }

    fn shutdown(mut self, sampling: SamplingLoop) {
        let uptime_secs = self.manager.uptime_secs();
        let sampling = Cell::new(Some(sampling));
        {
            let stop_sampling = || {
                if let Some(running) = sampling.take() {
                    running.stop();
                }
                true
            };
            let retract = || {
                self.manager.close("clean shutdown");
                true
            };
            let stop_transport = || {
                self.network.shutdown();
                true
            };
            let steps: Vec<(&str, &dyn Fn() -> bool)> = vec![
                ("stop sampling", &stop_sampling),
                ("retract and leave", &retract),
                ("stop transport", &stop_transport),
            ];
            ShutdownCoordinator::default().execute(&steps);
        }

        self.logger.shutdown();
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
        eprintln!("[GG-DAEMON] shutdown complete (uptime={uptime_secs}s)");
    }
}

impl std::fmt::Debug for NodeDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDaemon")
            .field("manager", &self.manager)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::thresholds::MemoryState;
    use crate::resource::events::ResourceType;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.member.id = Some("node-test".to_string());
        config.sampling.poll_interval_ms = 5;
        config.logging.jsonl_path = dir.join("activity.jsonl");
        config.logging.fallback_path = Some(dir.join("fallback.jsonl"));
        config
    }

    #[test]
    fn init_joins_member_and_run_exits_on_shutdown_flag() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalHandler::unregistered();
        let daemon = NodeDaemon::init(config_in(dir.path()), signals.clone()).unwrap();
        assert_eq!(daemon.manager().member().as_str(), "node-test");
        assert_eq!(
            daemon.manager().monitor(ResourceType::HeapMemory).unwrap().state(),
            MemoryState::Normal
        );

        signals.request_shutdown();
        daemon.run().unwrap();

        let log = std::fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert!(log.contains("member_start"), "{log}");
        assert!(log.contains("member_stop"), "{log}");
    }

    #[test]
    fn reload_applies_new_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = config_in(dir.path());
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        config.source_path = Some(path.clone());

        let mut daemon = NodeDaemon::init(config.clone(), SignalHandler::unregistered()).unwrap();
        config.heap.eviction_percent = 70.0;
        config.heap.critical_percent = 85.0;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        daemon.handle_config_reload();
        let thresholds = daemon.manager().monitor(ResourceType::HeapMemory).unwrap().thresholds();
        assert_eq!(thresholds.eviction_percent, 70.0);
        assert_eq!(thresholds.critical_percent, 85.0);
    }
}
