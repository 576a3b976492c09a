//! Memory samplers: the injectable source of `(bytes_used, max_bytes)` pairs.
//!
//! The pressure monitor never measures memory itself. It asks a
//! [`MemorySampler`] once per tick; tests hand it a [`FakeSampler`] and drive
//! usage explicitly.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::{GridError, Result};
use crate::platform::pal::Platform;

/// One usage measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub bytes_used: u64,
    pub max_bytes: u64,
}

/// Source of memory usage samples for one resource type.
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Result<MemorySample>;
}

/// Heap sampler backed by the platform reader: process RSS against total
/// system memory.
pub struct PlatformHeapSampler {
    platform: Arc<dyn Platform>,
}

impl PlatformHeapSampler {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

impl MemorySampler for PlatformHeapSampler {
    fn sample(&self) -> Result<MemorySample> {
        let bytes_used = self.platform.process_rss_bytes()?;
        let max_bytes = self.platform.memory_info()?.total_bytes;
        Ok(MemorySample {
            bytes_used,
            max_bytes,
        })
    }
}

#[derive(Debug)]
struct FakeState {
    bytes_used: u64,
    max_bytes: u64,
    pending_failures: u32,
    samples_taken: u64,
}

/// Deterministic sampler for tests: returns whatever usage was last set and
/// can be told to fail the next N samples.
#[derive(Debug)]
pub struct FakeSampler {
    state: Mutex<FakeState>,
}

impl FakeSampler {
    #[must_use]
    pub fn new(bytes_used: u64, max_bytes: u64) -> Self {
        Self {
            state: Mutex::new(FakeState {
                bytes_used,
                max_bytes,
                pending_failures: 0,
                samples_taken: 0,
            }),
        }
    }

    pub fn set_bytes_used(&self, bytes_used: u64) {
        self.state.lock().bytes_used = bytes_used;
    }

    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.state.lock().max_bytes = max_bytes;
    }

    /// Make the next `count` calls to `sample` fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().pending_failures = count;
    }

    /// Number of successful samples handed out.
    #[must_use]
    pub fn samples_taken(&self) -> u64 {
        self.state.lock().samples_taken
    }
}

impl MemorySampler for FakeSampler {
    fn sample(&self) -> Result<MemorySample> {
        let mut state = self.state.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(GridError::Runtime {
                details: "injected sampler failure".to_string(),
            });
        }
        state.samples_taken += 1;
        Ok(MemorySample {
            bytes_used: state.bytes_used,
            max_bytes: state.max_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::pal::{MemoryInfo, MockPlatform};

    #[test]
    fn fake_sampler_reports_latest_values() {
        let sampler = FakeSampler::new(10, 100);
        assert_eq!(
            sampler.sample().unwrap(),
            MemorySample {
                bytes_used: 10,
                max_bytes: 100
            }
        );
        sampler.set_bytes_used(96);
        sampler.set_max_bytes(200);
        let sample = sampler.sample().unwrap();
        assert_eq!(sample.bytes_used, 96);
        assert_eq!(sample.max_bytes, 200);
        assert_eq!(sampler.samples_taken(), 2);
    }

    #[test]
    fn fake_sampler_injects_failures() {
        let sampler = FakeSampler::new(10, 100);
        sampler.fail_next(2);
        assert!(sampler.sample().is_err());
        assert!(sampler.sample().is_err());
        assert!(sampler.sample().is_ok());
        assert_eq!(sampler.samples_taken(), 1);
    }

    #[test]
    fn platform_sampler_uses_rss_over_total() {
        let platform = Arc::new(MockPlatform::new(
            MemoryInfo {
                total_bytes: 8_000,
                available_bytes: 2_000,
                swap_total_bytes: 0,
                swap_free_bytes: 0,
            },
            3_000,
        ));
        let sampler = PlatformHeapSampler::new(platform.clone());
        let sample = sampler.sample().unwrap();
        assert_eq!(sample.bytes_used, 3_000);
        assert_eq!(sample.max_bytes, 8_000);

        platform.set_rss_bytes(7_500);
        assert_eq!(sampler.sample().unwrap().bytes_used, 7_500);
    }
}
