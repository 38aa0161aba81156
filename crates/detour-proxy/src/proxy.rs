//! Intercepting engine built on hudsucker.
//!
//! Binds the listener itself so bind failures surface from `start()`, then
//! runs the hudsucker proxy on a background task until `stop()` fires its
//! graceful-shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hudsucker::tokio_tungstenite::Connector;
use hudsucker::Proxy;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use detour_core::{
    CertValidationHook, EngineError, HookSet, InterceptEngine, RequestHook, TunnelHook,
};

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::RoutingHandler;
use crate::verifier::{https_connector, upstream_tls_config};

/// How long `stop()` waits for open connections before aborting them.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// [`InterceptEngine`] backed by a hudsucker MITM proxy.
pub struct HudsuckerEngine {
    ca_manager: CaManager,
    hooks: HookSet,
    shutdown_timeout: Duration,
    running: Option<ProxyHandle>,
}

impl std::fmt::Debug for HudsuckerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HudsuckerEngine")
            .field("ca_manager", &self.ca_manager)
            .field("hooks", &self.hooks)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("running", &self.running.as_ref().map(|r| r.addr))
            .finish()
    }
}

impl HudsuckerEngine {
    /// Creates an engine signing leaf certificates with the given CA.
    pub fn new(ca_manager: CaManager) -> Self {
        Self {
            ca_manager,
            hooks: HookSet::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            running: None,
        }
    }

    /// Creates an engine with the CA under the default data directory.
    pub fn with_default_dir() -> Result<Self> {
        Ok(Self::new(CaManager::with_default_dir()?))
    }

    /// Sets how long `stop()` waits for connections to drain.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Returns the CA certificate path for operator installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.ca_manager.cert_path()
    }

    /// Returns the address the engine is listening on, if running.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }
}

#[async_trait]
impl InterceptEngine for HudsuckerEngine {
    fn register_tunnel_hook(&mut self, hook: TunnelHook) {
        self.hooks.tunnel = Some(hook);
    }

    fn register_request_hook(&mut self, hook: RequestHook) {
        self.hooks.request = Some(hook);
    }

    fn register_cert_validation_hook(&mut self, hook: CertValidationHook) {
        self.hooks.cert_validation = Some(hook);
    }

    async fn start(&mut self, addr: SocketAddr) -> std::result::Result<SocketAddr, EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EngineError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| EngineError::Bind { addr, source })?;

        let authority = self.ca_manager.authority().map_err(ProxyError::from)?;
        let upstream_tls = upstream_tls_config(self.hooks.clone())?;
        let connector = https_connector(&upstream_tls);
        let handler = RoutingHandler::new(self.hooks.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_http_connector(connector)
            .with_http_handler(handler)
            .with_websocket_connector(Connector::Rustls(Arc::clone(&upstream_tls)))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .build()
            .map_err(|e| ProxyError::Build(e.to_string()))?;

        tracing::info!("Starting MITM proxy on {}", bound);
        tracing::info!("CA certificate: {:?}", self.ca_manager.cert_path());

        let handle = tokio::spawn(async move {
            if let Err(e) = proxy.start().await {
                tracing::error!("Proxy error: {}", e);
            }
            tracing::info!("Proxy server stopped");
        });

        self.running = Some(ProxyHandle {
            shutdown_tx,
            addr: bound,
            handle,
        });
        Ok(bound)
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop(self.shutdown_timeout).await;
        }
    }
}

/// Handle for controlling a running proxy server.
struct ProxyHandle {
    shutdown_tx: oneshot::Sender<()>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ProxyHandle {
    /// Signals shutdown and waits up to `timeout` for connections to drain.
    async fn stop(mut self, timeout: Duration) {
        let _ = self.shutdown_tx.send(());

        if tokio::time::timeout(timeout, &mut self.handle).await.is_err() {
            tracing::warn!(
                "Proxy did not drain within {:?}; aborting open connections",
                timeout
            );
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(temp_dir: &TempDir) -> HudsuckerEngine {
        HudsuckerEngine::new(CaManager::new(temp_dir.path().join("ca")))
            .with_shutdown_timeout(Duration::from_secs(1))
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn start_reports_bound_address() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = engine(&temp_dir);

        let bound = engine.start(loopback()).await.unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(engine.addr(), Some(bound));
        assert!(engine.ca_cert_path().exists());

        engine.stop().await;
        assert_eq!(engine.addr(), None);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = engine(&temp_dir);

        engine.start(loopback()).await.unwrap();
        assert!(matches!(
            engine.start(loopback()).await,
            Err(EngineError::AlreadyStarted)
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let occupied = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = occupied.local_addr().unwrap();

        let mut engine = engine(&temp_dir);
        let err = engine.start(addr).await.unwrap_err();
        assert!(matches!(err, EngineError::Bind { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn stop_is_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = engine(&temp_dir);

        engine.stop().await;
        engine.start(loopback()).await.unwrap();
        engine.stop().await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn listener_is_released_after_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = engine(&temp_dir);

        let bound = engine.start(loopback()).await.unwrap();
        engine.stop().await;

        let rebind = tokio::net::TcpListener::bind(bound).await;
        assert!(rebind.is_ok());
    }
}
