//! GG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cluster::member::MemberId;
use crate::resource::events::ResourceType;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, GridError>;

/// Top-level error type for gridguard.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("[GG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[GG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[GG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[GG-1004] no pressure monitor attached for resource {resource}")]
    UnknownResource { resource: ResourceType },

    #[error("[GG-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[GG-2001] memory sample failed for {resource}: {details}")]
    Sampling {
        resource: ResourceType,
        details: String,
    },

    #[error("[GG-2002] platform read failure on {path}: {details}")]
    PlatformRead { path: PathBuf, details: String },

    #[error("[GG-2101] {0}")]
    ResourceRejected(LowMemory),

    #[error("[GG-2102] remote operation {operation} failed: {source}")]
    RemoteOperationFailed {
        operation: String,
        #[source]
        source: Box<GridError>,
    },

    #[error("[GG-2201] listener {listener} failed on {resource}: {details}")]
    ListenerFailed {
        listener: String,
        resource: ResourceType,
        details: String,
    },

    #[error("[GG-2301] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[GG-3001] could not deliver advisor message to {member}: {details}")]
    Propagation { member: MemberId, details: String },

    #[error("[GG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[GG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[GG-3101] condition not reached within {waited_ms} ms: {what}")]
    ConvergenceTimeout { what: String, waited_ms: u64 },

    #[error("[GG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl GridError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "GG-1001",
            Self::MissingConfig { .. } => "GG-1002",
            Self::ConfigParse { .. } => "GG-1003",
            Self::UnknownResource { .. } => "GG-1004",
            Self::UnsupportedPlatform { .. } => "GG-1101",
            Self::Sampling { .. } => "GG-2001",
            Self::PlatformRead { .. } => "GG-2002",
            Self::ResourceRejected(_) => "GG-2101",
            Self::RemoteOperationFailed { .. } => "GG-2102",
            Self::ListenerFailed { .. } => "GG-2201",
            Self::Serialization { .. } => "GG-2301",
            Self::Propagation { .. } => "GG-3001",
            Self::Io { .. } => "GG-3002",
            Self::ChannelClosed { .. } => "GG-3003",
            Self::ConvergenceTimeout { .. } => "GG-3101",
            Self::Runtime { .. } => "GG-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// A rejection is never retried by this crate; whether to try again is the
    /// caller's decision.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Sampling { .. }
                | Self::PlatformRead { .. }
                | Self::Propagation { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::ConvergenceTimeout { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap an error raised on the serving member for delivery to a client.
    #[must_use]
    pub fn remote(operation: impl Into<String>, cause: Self) -> Self {
        Self::RemoteOperationFailed {
            operation: operation.into(),
            source: Box::new(cause),
        }
    }

    /// The low-memory rejection behind this error, looking through any
    /// number of remote-operation envelopes.
    #[must_use]
    pub fn rejection(&self) -> Option<&LowMemory> {
        match self {
            Self::ResourceRejected(low) => Some(low),
            Self::RemoteOperationFailed { source, .. } => source.rejection(),
            _ => None,
        }
    }

    /// True when this error (or its remote cause) is a resource rejection.
    #[must_use]
    pub fn is_resource_rejected(&self) -> bool {
        self.rejection().is_some()
    }
}

/// A data operation was refused because one or more members are over their
/// critical threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowMemory {
    pub resource: ResourceType,
    pub members: BTreeSet<MemberId>,
    pub region: Option<String>,
}

impl fmt::Display for LowMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<&str> = self.members.iter().map(MemberId::as_str).collect();
        write!(
            f,
            "{} critical on member(s) [{}]",
            self.resource,
            members.join(", ")
        )?;
        if let Some(region) = &self.region {
            write!(f, ", rejecting operation on region {region}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LowMemory {}

impl From<LowMemory> for GridError {
    fn from(value: LowMemory) -> Self {
        Self::ResourceRejected(value)
    }
}

impl From<serde_json::Error> for GridError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for GridError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
