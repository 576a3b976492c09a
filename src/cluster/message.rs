//! Advisor wire messages, exchanged as JSON.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::member::MemberId;
use crate::core::errors::Result;
use crate::monitor::thresholds::MemoryState;
use crate::resource::events::ResourceType;

/// What a member stopped participating in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum RetractionScope {
    /// Cache closed or member shutting down: every profile goes.
    Member,
    /// One resource type is no longer monitored on that member.
    Resource(ResourceType),
    /// The member no longer hosts this data region.
    Region(String),
}

impl fmt::Display for RetractionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Member => f.write_str("member"),
            Self::Resource(resource) => write!(f, "resource:{resource}"),
            Self::Region(region) => write!(f, "region:{region}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdvisorMessage {
    StateChanged {
        member: MemberId,
        resource: ResourceType,
        state: MemoryState,
        previous: MemoryState,
        /// Sender's confirmed state after this event; what peers record.
        settled: MemoryState,
        /// Per-sender counter, strictly increasing across all of its state
        /// messages. Orders delivery; `timestamp` is informational only.
        sequence: u64,
        bytes_used: u64,
        max_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    Retracted {
        member: MemberId,
        scope: RetractionScope,
    },
    ScopeRestored {
        member: MemberId,
        region: String,
    },
}

impl AdvisorMessage {
    /// Member the message is about (always its sender).
    #[must_use]
    pub const fn member(&self) -> &MemberId {
        match self {
            Self::StateChanged { member, .. }
            | Self::Retracted { member, .. }
            | Self::ScopeRestored { member, .. } => member,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged_json() {
        let msg = AdvisorMessage::Retracted {
            member: MemberId::from("server-2"),
            scope: RetractionScope::Region("orders".to_string()),
        };
        let raw = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "retracted");
        assert_eq!(value["member"], "server-2");
        assert_eq!(value["scope"]["kind"], "region");
        assert_eq!(value["scope"]["name"], "orders");
        assert_eq!(AdvisorMessage::decode(&raw).unwrap(), msg);
    }

    #[test]
    fn state_change_carries_screaming_state_names() {
        let msg = AdvisorMessage::StateChanged {
            member: MemberId::from("server-1"),
            resource: ResourceType::OffHeapMemory,
            state: MemoryState::CriticalDisabled,
            previous: MemoryState::Critical,
            settled: MemoryState::CriticalDisabled,
            sequence: 7,
            bytes_used: 10,
            max_bytes: 20,
            timestamp: Utc::now(),
        };
        let raw = msg.encode().unwrap();
        assert!(raw.contains("\"CRITICAL_DISABLED\""), "{raw}");
        assert!(raw.contains("\"off_heap_memory\""), "{raw}");
        assert!(raw.contains("\"sequence\":7"), "{raw}");
        assert_eq!(msg.member().as_str(), "server-1");
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = AdvisorMessage::decode("{\"type\":\"nope\"}").unwrap_err();
        assert_eq!(err.code(), "GG-2301");
    }

    #[test]
    fn scope_display_is_compact() {
        assert_eq!(RetractionScope::Member.to_string(), "member");
        assert_eq!(
            RetractionScope::Resource(ResourceType::HeapMemory).to_string(),
            "resource:heap memory"
        );
    }
}
