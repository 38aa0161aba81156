//! Error types for the proxy engine.

use std::path::PathBuf;

use thiserror::Error;

/// Engine setup failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("root CA unavailable: {0}")]
    Ca(#[from] CaManagerError),

    /// Upstream TLS client could not be configured.
    #[error("upstream TLS setup failed: {0}")]
    Tls(String),

    /// hudsucker rejected the proxy configuration.
    #[error("proxy build failed: {0}")]
    Build(String),
}

/// Root CA failures.
#[derive(Debug, Error)]
pub enum CaManagerError {
    #[error("no data directory available for the root CA")]
    NoDataDir,

    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key or certificate generation failed.
    #[error("generating root CA: {0}")]
    Generate(String),

    /// A stored file exists but does not hold a usable key or certificate.
    #[error("{path:?} is not a valid CA file: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl CaManagerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaManagerError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ProxyError> for detour_core::EngineError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Ca(e) => detour_core::EngineError::Ca(e.to_string()),
            other => detour_core::EngineError::Engine(other.to_string()),
        }
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
