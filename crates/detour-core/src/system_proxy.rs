//! OS system-proxy adapter contract.

use std::net::SocketAddr;

use crate::error::SystemProxyError;

/// Registers and reverts the OS-wide HTTP/HTTPS proxy setting.
///
/// Implementations return [`SystemProxyError::Unsupported`] on platforms
/// without a system-wide proxy registry.
pub trait SystemProxy: Send + Sync {
    /// Points the OS HTTP and HTTPS proxy at `endpoint`.
    fn set_system_proxy(&self, endpoint: SocketAddr) -> Result<(), SystemProxyError>;

    /// Disables the OS proxy setting.
    fn clear_system_proxy(&self) -> Result<(), SystemProxyError>;
}

/// Adapter used when registration is turned off; clients must be pointed at
/// the proxy by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualSystemProxy;

impl SystemProxy for ManualSystemProxy {
    fn set_system_proxy(&self, _endpoint: SocketAddr) -> Result<(), SystemProxyError> {
        Err(SystemProxyError::Unsupported(
            "registration disabled".to_string(),
        ))
    }

    fn clear_system_proxy(&self) -> Result<(), SystemProxyError> {
        Ok(())
    }
}
