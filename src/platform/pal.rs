//! PAL trait and platform-specific memory readers.

#![allow(missing_docs)]

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::errors::{GridError, Result};

/// Current system memory info.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_free_bytes: u64,
}

/// OS abstraction used by the platform heap sampler.
pub trait Platform: Send + Sync {
    fn memory_info(&self) -> Result<MemoryInfo>;
    /// Resident set size of the current process.
    fn process_rss_bytes(&self) -> Result<u64>;
}

/// Linux platform implementation using `/proc`.
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl Platform for LinuxPlatform {
    fn memory_info(&self) -> Result<MemoryInfo> {
        let raw = fs::read_to_string("/proc/meminfo").map_err(|source| GridError::Io {
            path: PathBuf::from("/proc/meminfo"),
            source,
        })?;
        parse_meminfo(&raw)
    }

    fn process_rss_bytes(&self) -> Result<u64> {
        let raw = fs::read_to_string("/proc/self/status").map_err(|source| GridError::Io {
            path: PathBuf::from("/proc/self/status"),
            source,
        })?;
        parse_status_rss(&raw)
    }
}

#[cfg(not(target_os = "linux"))]
impl Platform for LinuxPlatform {
    fn memory_info(&self) -> Result<MemoryInfo> {
        Err(GridError::UnsupportedPlatform {
            details: "/proc/meminfo is only available on Linux".to_string(),
        })
    }

    fn process_rss_bytes(&self) -> Result<u64> {
        Err(GridError::UnsupportedPlatform {
            details: "/proc/self/status is only available on Linux".to_string(),
        })
    }
}

/// In-memory mock implementation for deterministic tests.
#[derive(Debug)]
pub struct MockPlatform {
    memory: MemoryInfo,
    rss_bytes: AtomicU64,
}

impl MockPlatform {
    #[must_use]
    pub fn new(memory: MemoryInfo, rss_bytes: u64) -> Self {
        Self {
            memory,
            rss_bytes: AtomicU64::new(rss_bytes),
        }
    }

    pub fn set_rss_bytes(&self, bytes: u64) {
        self.rss_bytes.store(bytes, Ordering::Relaxed);
    }
}

impl Platform for MockPlatform {
    fn memory_info(&self) -> Result<MemoryInfo> {
        Ok(self.memory.clone())
    }

    fn process_rss_bytes(&self) -> Result<u64> {
        Ok(self.rss_bytes.load(Ordering::Relaxed))
    }
}

/// Detect active platform implementation.
pub fn detect_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(GridError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}

fn platform_read_error(path: &str, details: String) -> GridError {
    GridError::PlatformRead {
        path: PathBuf::from(path),
        details,
    }
}

/// Parse a `Key: <value> [kB]` line into bytes.
fn parse_kb_value(line: &str, rest: &str, source: &str) -> Result<u64> {
    let mut parts = rest.split_whitespace();
    let Some(value_raw) = parts.next() else {
        return Err(platform_read_error(source, format!("missing value in line: {line}")));
    };
    let value = value_raw.parse::<u64>().map_err(|err| {
        platform_read_error(
            source,
            format!("invalid numeric value in line {line:?}: {err}"),
        )
    })?;
    match parts.next() {
        None => Ok(value),
        Some("kB") => Ok(value.saturating_mul(1024)),
        Some(unit) => Err(platform_read_error(
            source,
            format!("unsupported unit in line {line:?}: {unit}"),
        )),
    }
}

fn parse_meminfo(raw: &str) -> Result<MemoryInfo> {
    const SOURCE: &str = "/proc/meminfo";
    let mut values = HashMap::<String, u64>::new();

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, rest)) = line.split_once(':') else {
            return Err(platform_read_error(
                SOURCE,
                format!("invalid meminfo line (missing ':'): {line}"),
            ));
        };
        values.insert(key.trim().to_string(), parse_kb_value(line, rest, SOURCE)?);
    }

    let required = |key: &str| {
        values
            .get(key)
            .copied()
            .ok_or_else(|| platform_read_error(SOURCE, format!("missing required meminfo field: {key}")))
    };

    Ok(MemoryInfo {
        total_bytes: required("MemTotal")?,
        available_bytes: required("MemAvailable")?,
        swap_total_bytes: required("SwapTotal")?,
        swap_free_bytes: required("SwapFree")?,
    })
}

fn parse_status_rss(raw: &str) -> Result<u64> {
    const SOURCE: &str = "/proc/self/status";
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return parse_kb_value(line, rest, SOURCE);
        }
    }
    Err(platform_read_error(SOURCE, "VmRSS field not present".to_string()))
}
