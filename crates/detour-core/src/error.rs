//! Error types for the core crate.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while creating or loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON or lacks a required field.
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parsed but a value is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors reported by an intercepting proxy engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The engine is already running.
    #[error("engine already started")]
    AlreadyStarted,

    /// Certificate authority could not be prepared.
    #[error("certificate authority error: {0}")]
    Ca(String),

    /// Any other engine-specific failure.
    #[error("engine error: {0}")]
    Engine(String),
}

/// Errors reported by an OS system-proxy adapter.
#[derive(Debug, Error)]
pub enum SystemProxyError {
    /// The platform has no system-wide proxy registry we can drive.
    #[error("system proxy not supported: {0}")]
    Unsupported(String),

    /// An OS tool or API call reported failure.
    #[error("system proxy command failed: {0}")]
    Command(String),

    /// IO error while talking to the OS.
    #[error("system proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the proxy lifecycle manager.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `start()` was called outside the `Created` state.
    #[error("proxy cannot start from state {0:?}")]
    InvalidState(crate::lifecycle::LifecycleState),

    /// The engine failed to start.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
