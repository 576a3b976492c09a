//! Memory states, threshold snapshots, and the pure usage classifier.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::float_cmp)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::{GridError, Result};

/// Classification of a member's memory usage for one resource type.
///
/// The `*Disabled` states mean the corresponding threshold is configured to
/// zero; they say nothing about actual usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum MemoryState {
    Normal = 0,
    Eviction = 1,
    Critical = 2,
    EvictionDisabled = 3,
    CriticalDisabled = 4,
}

impl MemoryState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Normal,
        Self::Eviction,
        Self::Critical,
        Self::EvictionDisabled,
        Self::CriticalDisabled,
    ];

    /// Escalation rank: NORMAL < EVICTION < CRITICAL. Disabled states rank
    /// with NORMAL since they never signal pressure.
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Eviction => 1,
            Self::Critical => 2,
            Self::Normal | Self::EvictionDisabled | Self::CriticalDisabled => 0,
        }
    }

    #[must_use]
    pub const fn is_disabled(self) -> bool {
        matches!(self, Self::EvictionDisabled | Self::CriticalDisabled)
    }

    /// Sick: writes targeting this member are rejected.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Critical)
    }

    /// True when the eviction machinery should be running.
    #[must_use]
    pub const fn is_evicting(self) -> bool {
        matches!(self, Self::Eviction | Self::Critical)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Eviction => "EVICTION",
            Self::Critical => "CRITICAL",
            Self::EvictionDisabled => "EVICTION_DISABLED",
            Self::CriticalDisabled => "CRITICAL_DISABLED",
        }
    }

    #[must_use]
    pub(crate) const fn to_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Eviction,
            2 => Self::Critical,
            3 => Self::EvictionDisabled,
            4 => Self::CriticalDisabled,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two configurable threshold axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdAxis {
    Eviction,
    Critical,
}

impl ThresholdAxis {
    /// State reported when this axis is turned off.
    #[must_use]
    pub const fn disabled_state(self) -> MemoryState {
        match self {
            Self::Eviction => MemoryState::EvictionDisabled,
            Self::Critical => MemoryState::CriticalDisabled,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eviction => "eviction",
            Self::Critical => "critical",
        }
    }
}

/// Immutable threshold snapshot. A percent of 0 disables that axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_bytes: u64,
    pub eviction_percent: f64,
    pub critical_percent: f64,
}

impl Thresholds {
    #[must_use]
    pub const fn new(max_bytes: u64, eviction_percent: f64, critical_percent: f64) -> Self {
        Self {
            max_bytes,
            eviction_percent,
            critical_percent,
        }
    }

    /// Both axes off.
    #[must_use]
    pub const fn disabled(max_bytes: u64) -> Self {
        Self::new(max_bytes, 0.0, 0.0)
    }

    #[must_use]
    pub fn eviction_bytes(&self) -> u64 {
        percent_of(self.max_bytes, self.eviction_percent)
    }

    #[must_use]
    pub fn critical_bytes(&self) -> u64 {
        percent_of(self.max_bytes, self.critical_percent)
    }

    #[must_use]
    pub fn percent(&self, axis: ThresholdAxis) -> f64 {
        match axis {
            ThresholdAxis::Eviction => self.eviction_percent,
            ThresholdAxis::Critical => self.critical_percent,
        }
    }

    #[must_use]
    pub fn is_enabled(&self, axis: ThresholdAxis) -> bool {
        self.percent(axis) != 0.0
    }

    /// Copy with one axis replaced.
    #[must_use]
    pub fn with_percent(self, axis: ThresholdAxis, percent: f64) -> Self {
        match axis {
            ThresholdAxis::Eviction => Self {
                eviction_percent: percent,
                ..self
            },
            ThresholdAxis::Critical => Self {
                critical_percent: percent,
                ..self
            },
        }
    }

    /// Configuration-boundary check: each percent in `[0, 100]` and, when
    /// both are enabled, critical at or above eviction.
    pub fn validate(&self) -> Result<()> {
        validate_percent("eviction_percent", self.eviction_percent)?;
        validate_percent("critical_percent", self.critical_percent)?;
        if self.eviction_percent != 0.0
            && self.critical_percent != 0.0
            && self.critical_percent < self.eviction_percent
        {
            return Err(GridError::InvalidConfig {
                details: format!(
                    "critical_percent ({}) must be >= eviction_percent ({})",
                    self.critical_percent, self.eviction_percent
                ),
            });
        }
        Ok(())
    }

    fn is_sane(&self) -> bool {
        self.max_bytes > 0 && is_percent(self.eviction_percent) && is_percent(self.critical_percent)
    }
}

/// Map one usage sample to exactly one state.
///
/// Precedence: a disabled critical axis wins, then critical usage, then a
/// disabled eviction axis, then eviction usage. Nonsensical thresholds (zero
/// maximum, out-of-range percents) classify as `Normal`.
#[must_use]
pub fn classify(bytes_used: u64, thresholds: &Thresholds) -> MemoryState {
    if thresholds.critical_percent == 0.0 {
        return MemoryState::CriticalDisabled;
    }
    if !thresholds.is_sane() {
        return MemoryState::Normal;
    }
    if bytes_used >= thresholds.critical_bytes() {
        return MemoryState::Critical;
    }
    if thresholds.eviction_percent == 0.0 {
        return MemoryState::EvictionDisabled;
    }
    if bytes_used >= thresholds.eviction_bytes() {
        MemoryState::Eviction
    } else {
        MemoryState::Normal
    }
}

/// Reject a percent outside `[0, 100]` (or not a number).
pub fn validate_percent(name: &str, value: f64) -> Result<()> {
    if !is_percent(value) {
        return Err(GridError::InvalidConfig {
            details: format!("{name} must be in [0, 100], got {value}"),
        });
    }
    Ok(())
}

fn is_percent(value: f64) -> bool {
    value.is_finite() && (0.0..=100.0).contains(&value)
}

fn percent_of(max_bytes: u64, percent: f64) -> u64 {
    ((max_bytes as f64 * percent) / 100.0) as u64
}
