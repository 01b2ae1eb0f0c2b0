//! Error types for the resolve-and-dispatch engine

use thiserror::Error;

/// Bad timeline input detected while resolving
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("duplicate timeline object id '{0}'")]
    DuplicateId(String),

    #[error("timeline object '{0}' has an empty layer")]
    EmptyLayer(String),

    #[error("timeline object '{id}' ends ({end}) before it starts ({start})")]
    EndBeforeStart { id: String, start: i64, end: i64 },

    #[error("timeline object '{id}' has a negative duration ({duration})")]
    NegativeDuration { id: String, duration: i64 },
}

/// Errors surfaced by the conductor's public API
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("device '{0}' already exists")]
    DeviceExists(String),

    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("device '{id}' failed to initialize: {source}")]
    DeviceInit {
        id: String,
        #[source]
        source: DeviceError,
    },

    #[error("conductor is not running")]
    Stopped,
}

/// Errors raised by a device driver
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("not connected")]
    NotConnected,

    #[error("device has been terminated")]
    Terminated,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
