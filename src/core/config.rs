//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::member::MemberId;
use crate::core::errors::{GridError, Result};
use crate::monitor::thresholds::{Thresholds, validate_percent};
use crate::resource::events::ResourceType;

/// Full gridguard configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub member: MemberConfig,
    pub heap: ResourceConfig,
    pub off_heap: ResourceConfig,
    pub sampling: SamplingConfig,
    pub cluster: ClusterConfig,
    pub logging: LoggingConfig,
    /// File this configuration was loaded from, if any.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MemberConfig {
    /// Member identity; derived from host name and pid when unset.
    pub id: Option<String>,
}

/// Per-resource thresholds. A percent of 0 disables that axis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub eviction_percent: f64,
    pub critical_percent: f64,
    /// Extra consecutive worse samples required before escalating.
    pub tolerance: u32,
    /// Overrides the sampler's maximum when set.
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplingConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub convergence_timeout_ms: u64,
    pub convergence_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub jsonl_path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            eviction_percent: 0.0,
            critical_percent: 0.0,
            tolerance: 1,
            max_bytes: None,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            convergence_timeout_ms: 10_000,
            convergence_poll_ms: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            jsonl_path: PathBuf::from(format!("{home}/.local/share/gridguard/activity.jsonl")),
            fallback_path: Some(PathBuf::from("/tmp/gridguard-activity.jsonl")),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 5,
            channel_capacity: 1024,
        }
    }
}

impl ResourceConfig {
    /// Threshold snapshot against a sampled (or overridden) maximum.
    #[must_use]
    pub fn thresholds(&self, sampled_max_bytes: u64) -> Thresholds {
        Thresholds::new(
            self.max_bytes.unwrap_or(sampled_max_bytes),
            self.eviction_percent,
            self.critical_percent,
        )
    }

    fn validate(&self, section: &str) -> Result<()> {
        validate_percent(&format!("{section}.eviction_percent"), self.eviction_percent)?;
        validate_percent(&format!("{section}.critical_percent"), self.critical_percent)?;
        if self.eviction_percent != 0.0
            && self.critical_percent != 0.0
            && self.critical_percent < self.eviction_percent
        {
            return Err(GridError::InvalidConfig {
                details: format!(
                    "{section}.critical_percent ({}) must be >= {section}.eviction_percent ({})",
                    self.critical_percent, self.eviction_percent
                ),
            });
        }
        if self.max_bytes == Some(0) {
            return Err(GridError::InvalidConfig {
                details: format!("{section}.max_bytes must be > 0 when set"),
            });
        }
        Ok(())
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(format!("{home}/.config/gridguard/config.toml"))
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| GridError::io(&path_buf, source))?;
            let mut parsed: Self = toml::from_str(&raw)?;
            parsed.source_path = Some(path_buf);
            parsed
        } else if path.is_some() {
            return Err(GridError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a TOML document without touching the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Effective member identity.
    #[must_use]
    pub fn member_id(&self) -> MemberId {
        self.member
            .id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map_or_else(MemberId::for_this_process, MemberId::from)
    }

    #[must_use]
    pub const fn resource(&self, resource: ResourceType) -> &ResourceConfig {
        match resource {
            ResourceType::HeapMemory => &self.heap,
            ResourceType::OffHeapMemory => &self.off_heap,
        }
    }

    /// FNV-1a of the canonical JSON form, for log correlation.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GridError::Serialization {
            context: "toml",
            details: e.to_string(),
        })
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("GRIDGUARD_MEMBER_ID") {
            self.member.id = Some(raw);
        }

        for (prefix, section) in [("HEAP", &mut self.heap), ("OFF_HEAP", &mut self.off_heap)] {
            set_f64(&mut lookup, &format!("GRIDGUARD_{prefix}_EVICTION_PERCENT"), &mut section.eviction_percent)?;
            set_f64(&mut lookup, &format!("GRIDGUARD_{prefix}_CRITICAL_PERCENT"), &mut section.critical_percent)?;
            let name = format!("GRIDGUARD_{prefix}_TOLERANCE");
            if let Some(raw) = lookup(&name) {
                section.tolerance = parse_env(&name, &raw)?;
            }
            let name = format!("GRIDGUARD_{prefix}_MAX_BYTES");
            if let Some(raw) = lookup(&name) {
                section.max_bytes = Some(parse_env(&name, &raw)?);
            }
        }

        set_u64(&mut lookup, "GRIDGUARD_POLL_INTERVAL_MS", &mut self.sampling.poll_interval_ms)?;
        set_u64(
            &mut lookup,
            "GRIDGUARD_CONVERGENCE_TIMEOUT_MS",
            &mut self.cluster.convergence_timeout_ms,
        )?;
        set_u64(
            &mut lookup,
            "GRIDGUARD_CONVERGENCE_POLL_MS",
            &mut self.cluster.convergence_poll_ms,
        )?;

        if let Some(raw) = lookup("GRIDGUARD_LOG_PATH") {
            self.logging.jsonl_path = PathBuf::from(raw);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.heap.validate("heap")?;
        self.off_heap.validate("off_heap")?;

        if self.sampling.poll_interval_ms == 0 {
            return Err(GridError::InvalidConfig {
                details: "sampling.poll_interval_ms must be > 0".to_string(),
            });
        }
        if self.cluster.convergence_poll_ms == 0
            || self.cluster.convergence_poll_ms > self.cluster.convergence_timeout_ms
        {
            return Err(GridError::InvalidConfig {
                details: format!(
                    "cluster.convergence_poll_ms must be in (0, convergence_timeout_ms={}], got {}",
                    self.cluster.convergence_timeout_ms, self.cluster.convergence_poll_ms
                ),
            });
        }
        if self.logging.channel_capacity == 0 {
            return Err(GridError::InvalidConfig {
                details: "logging.channel_capacity must be > 0".to_string(),
            });
        }
        if self.logging.max_size_bytes == 0 {
            return Err(GridError::InvalidConfig {
                details: "logging.max_size_bytes must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| GridError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn set_f64<F>(lookup: &mut F, name: &str, slot: &mut f64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}
