//! Proxy lifecycle manager.
//!
//! Owns the engine and the OS proxy adapter and walks them through
//! `Created -> Listening -> ShuttingDown -> Stopped`. Teardown is guarded by a
//! compare-and-swap on the state, so `shutdown()` may be called from the
//! normal exit path, a signal handler and the guardian watcher at the same
//! time and still runs exactly once.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;

use crate::engine::InterceptEngine;
use crate::error::{LifecycleError, SystemProxyError};
use crate::routing::RoutingPolicy;
use crate::system_proxy::SystemProxy;

/// Lower bound (inclusive) of the random bind port range.
pub const RANDOM_PORT_MIN: u16 = 10000;
/// Upper bound (exclusive) of the random bind port range.
pub const RANDOM_PORT_MAX: u16 = 60000;

/// Lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Constructed, not yet listening.
    Created = 0,
    /// Engine is accepting connections.
    Listening = 1,
    /// Teardown in progress.
    ShuttingDown = 2,
    /// Engine stopped and OS proxy reverted.
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Listening,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Returns `configured`, or a random port in `[10000, 60000)` when it is 0.
pub fn resolve_bind_port(configured: u16) -> u16 {
    if configured != 0 {
        return configured;
    }
    rand::thread_rng().gen_range(RANDOM_PORT_MIN..RANDOM_PORT_MAX)
}

/// Drives the engine and the OS proxy setting through startup and shutdown.
pub struct ProxyLifecycle {
    policy: Arc<RoutingPolicy>,
    engine: tokio::sync::Mutex<Box<dyn InterceptEngine>>,
    system_proxy: Arc<dyn SystemProxy>,
    bind_ip: IpAddr,
    state: AtomicU8,
    stopped: watch::Sender<bool>,
    endpoint: Mutex<Option<SocketAddr>>,
    proxy_registered: AtomicBool,
}

impl std::fmt::Debug for ProxyLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLifecycle")
            .field("state", &self.state())
            .field("bind_ip", &self.bind_ip)
            .field("endpoint", &self.endpoint())
            .field("proxy_registered", &self.proxy_registered.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProxyLifecycle {
    /// Creates a lifecycle manager bound to loopback.
    pub fn new(
        policy: Arc<RoutingPolicy>,
        engine: Box<dyn InterceptEngine>,
        system_proxy: Arc<dyn SystemProxy>,
    ) -> Self {
        Self {
            policy,
            engine: tokio::sync::Mutex::new(engine),
            system_proxy,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            state: AtomicU8::new(LifecycleState::Created as u8),
            stopped: watch::channel(false).0,
            endpoint: Mutex::new(None),
            proxy_registered: AtomicBool::new(false),
        }
    }

    /// Sets the address the engine listens on.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns the bound endpoint once listening.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.lock()
    }

    /// Returns the routing policy.
    pub fn policy(&self) -> &Arc<RoutingPolicy> {
        &self.policy
    }

    /// Binds the engine, installs the routing hooks, and registers the
    /// endpoint as the OS proxy.
    ///
    /// Only valid from `Created`. A bind failure leaves the state unchanged
    /// and is returned to the caller, who treats it as fatal.
    pub async fn start(&self) -> Result<SocketAddr, LifecycleError> {
        // Held until the state leaves `Created`. A shutdown arriving meanwhile
        // waits here and then tears down a fully registered proxy.
        let mut engine = self.engine.lock().await;

        let state = self.state();
        if state != LifecycleState::Created {
            return Err(LifecycleError::InvalidState(state));
        }

        let hooks = self.policy.hooks();
        if let Some(hook) = hooks.tunnel {
            engine.register_tunnel_hook(hook);
        }
        if let Some(hook) = hooks.request {
            engine.register_request_hook(hook);
        }
        if let Some(hook) = hooks.cert_validation {
            engine.register_cert_validation_hook(hook);
        }

        let port = resolve_bind_port(self.policy.config().bind_port());
        let requested = SocketAddr::new(self.bind_ip, port);
        tracing::debug!("Binding proxy engine to {}", requested);

        let bound = engine.start(requested).await?;

        *self.endpoint.lock() = Some(bound);
        tracing::info!("Proxy listening on {}", bound);

        self.register_system_proxy(bound);

        self.state
            .store(LifecycleState::Listening as u8, Ordering::SeqCst);
        drop(engine);

        Ok(bound)
    }

    fn register_system_proxy(&self, bound: SocketAddr) {
        let endpoint = registration_endpoint(bound);

        match self.system_proxy.set_system_proxy(endpoint) {
            Ok(()) => {
                self.proxy_registered.store(true, Ordering::SeqCst);
                tracing::info!("System proxy set to {}", endpoint);
            }
            Err(SystemProxyError::Unsupported(reason)) => {
                tracing::warn!(
                    "System proxy not supported ({}); point clients at {} manually",
                    reason,
                    endpoint
                );
            }
            Err(e) => {
                tracing::error!("Failed to set system proxy to {}: {}", endpoint, e);
            }
        }
    }

    /// Stops the engine and reverts the OS proxy, exactly once.
    ///
    /// Returns `true` for the call that performed the transition to
    /// `Stopped`. Concurrent callers wait until teardown has finished and
    /// return `false`.
    pub async fn shutdown(&self) -> bool {
        loop {
            match self.state.compare_exchange(
                LifecycleState::Listening as u8,
                LifecycleState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.teardown().await;
                    return true;
                }
                Err(current) => match LifecycleState::from_u8(current) {
                    LifecycleState::Created => {
                        // Leaving `Created` requires the engine lock, so an
                        // in-flight start() finishes first.
                        let _engine = self.engine.lock().await;
                        if self
                            .state
                            .compare_exchange(
                                LifecycleState::Created as u8,
                                LifecycleState::Stopped as u8,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok()
                        {
                            tracing::debug!("Shutdown requested before the proxy started");
                            self.stopped.send_replace(true);
                            return true;
                        }
                        // start() won the lock; retry against `Listening`.
                    }
                    LifecycleState::ShuttingDown => {
                        self.wait_stopped().await;
                        return false;
                    }
                    LifecycleState::Stopped | LifecycleState::Listening => return false,
                },
            }
        }
    }

    async fn teardown(&self) {
        tracing::info!("Shutting down proxy");

        self.engine.lock().await.stop().await;

        if self.proxy_registered.swap(false, Ordering::SeqCst) {
            match self.system_proxy.clear_system_proxy() {
                Ok(()) => tracing::info!("System proxy cleared"),
                Err(e) => tracing::warn!("Failed to clear system proxy: {}", e),
            }
        }

        *self.endpoint.lock() = None;
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::SeqCst);
        self.stopped.send_replace(true);
        tracing::info!("Proxy stopped");
    }

    /// Resolves once the lifecycle has reached `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Address to publish as the OS proxy: wildcard binds are reached via
/// loopback.
fn registration_endpoint(bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
    } else {
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::engine::{CertValidationHook, HookSet, RequestHook, TunnelHook};
    use crate::error::EngineError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    // ==================== Test Doubles ====================

    /// Shared view into a [`ReplayEngine`] after it has been boxed.
    #[derive(Default)]
    struct EngineSpy {
        hooks: Mutex<HookSet>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        bound: Mutex<Option<SocketAddr>>,
    }

    /// Engine double: records hooks and replays hostnames without sockets.
    struct ReplayEngine {
        spy: Arc<EngineSpy>,
        fail_bind: bool,
    }

    impl ReplayEngine {
        fn new() -> (Self, Arc<EngineSpy>) {
            let spy = Arc::new(EngineSpy::default());
            let engine = Self {
                spy: Arc::clone(&spy),
                fail_bind: false,
            };
            (engine, spy)
        }

        fn failing() -> (Self, Arc<EngineSpy>) {
            let (mut engine, spy) = Self::new();
            engine.fail_bind = true;
            (engine, spy)
        }
    }

    #[async_trait]
    impl InterceptEngine for ReplayEngine {
        fn register_tunnel_hook(&mut self, hook: TunnelHook) {
            self.spy.hooks.lock().tunnel = Some(hook);
        }

        fn register_request_hook(&mut self, hook: RequestHook) {
            self.spy.hooks.lock().request = Some(hook);
        }

        fn register_cert_validation_hook(&mut self, hook: CertValidationHook) {
            self.spy.hooks.lock().cert_validation = Some(hook);
        }

        async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr, EngineError> {
            self.spy.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_bind {
                return Err(EngineError::Bind {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
                });
            }
            *self.spy.bound.lock() = Some(addr);
            Ok(addr)
        }

        async fn stop(&mut self) {
            self.spy.stops.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }
    }

    /// OS adapter double counting set/clear calls.
    #[derive(Default)]
    struct RecordingSystemProxy {
        set_calls: Mutex<Vec<SocketAddr>>,
        clear_calls: AtomicUsize,
        unsupported: bool,
        fail_clear: bool,
        set_delay: Option<std::time::Duration>,
    }

    impl SystemProxy for RecordingSystemProxy {
        fn set_system_proxy(&self, endpoint: SocketAddr) -> Result<(), SystemProxyError> {
            if let Some(delay) = self.set_delay {
                std::thread::sleep(delay);
            }
            if self.unsupported {
                return Err(SystemProxyError::Unsupported("test platform".to_string()));
            }
            self.set_calls.lock().push(endpoint);
            Ok(())
        }

        fn clear_system_proxy(&self) -> Result<(), SystemProxyError> {
            self.clear_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_clear {
                return Err(SystemProxyError::Command("registry locked".to_string()));
            }
            Ok(())
        }
    }

    fn policy(bind_port: u16) -> Arc<RoutingPolicy> {
        let config = PolicyConfig::new("10.0.0.5", 8080)
            .with_bind_port(bind_port)
            .with_redirect_domains(["example.com"])
            .with_block_paths(["/login"]);
        Arc::new(RoutingPolicy::new(config).unwrap())
    }

    fn lifecycle(
        engine: ReplayEngine,
        system_proxy: Arc<RecordingSystemProxy>,
    ) -> ProxyLifecycle {
        ProxyLifecycle::new(policy(18080), Box::new(engine), system_proxy)
    }

    // ==================== Port Resolution ====================

    #[test]
    fn configured_port_is_kept() {
        assert_eq!(resolve_bind_port(18080), 18080);
    }

    #[test]
    fn zero_port_picks_from_range() {
        for _ in 0..200 {
            let port = resolve_bind_port(0);
            assert!((RANDOM_PORT_MIN..RANDOM_PORT_MAX).contains(&port));
        }
    }

    #[test]
    fn wildcard_bind_registers_loopback() {
        let bound: SocketAddr = "0.0.0.0:18080".parse().unwrap();
        assert_eq!(
            registration_endpoint(bound),
            "127.0.0.1:18080".parse::<SocketAddr>().unwrap()
        );

        let bound: SocketAddr = "192.168.1.2:18080".parse().unwrap();
        assert_eq!(registration_endpoint(bound), bound);
    }

    // ==================== Start ====================

    #[tokio::test]
    async fn start_binds_and_registers_system_proxy() {
        let (engine, spy) = ReplayEngine::new();
        let system_proxy = Arc::new(RecordingSystemProxy::default());
        let lifecycle = lifecycle(engine, Arc::clone(&system_proxy));

        let bound = tokio_test::assert_ok!(lifecycle.start().await);

        assert_eq!(bound, "127.0.0.1:18080".parse::<SocketAddr>().unwrap());
        assert_eq!(lifecycle.state(), LifecycleState::Listening);
        assert_eq!(lifecycle.endpoint(), Some(bound));
        assert_eq!(*system_proxy.set_calls.lock(), vec![bound]);
        assert_eq!(spy.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_installs_routing_hooks() {
        let (engine, spy) = ReplayEngine::new();
        let lifecycle = lifecycle(engine, Arc::new(RecordingSystemProxy::default()));
        lifecycle.start().await.unwrap();

        let hooks = spy.hooks.lock().clone();
        assert!(hooks.should_intercept("api.example.com:443"));
        assert!(!hooks.should_intercept("api.other.org:443"));
        assert!(hooks.request.is_some());
        assert!(hooks.cert_validation.is_some());
    }

    #[tokio::test]
    async fn random_port_when_unconfigured() {
        let (engine, spy) = ReplayEngine::new();
        let lifecycle = ProxyLifecycle::new(
            policy(0),
            Box::new(engine),
            Arc::new(RecordingSystemProxy::default()),
        );

        let bound = lifecycle.start().await.unwrap();
        assert!((RANDOM_PORT_MIN..RANDOM_PORT_MAX).contains(&bound.port()));
        assert_eq!(*spy.bound.lock(), Some(bound));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (engine, spy) = ReplayEngine::new();
        let lifecycle = lifecycle(engine, Arc::new(RecordingSystemProxy::default()));
        lifecycle.start().await.unwrap();

        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState(LifecycleState::Listening)
        ));
        assert_eq!(spy.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let (engine, _spy) = ReplayEngine::failing();
        let system_proxy = Arc::new(RecordingSystemProxy::default());
        let lifecycle = lifecycle(engine, Arc::clone(&system_proxy));

        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Engine(EngineError::Bind { .. })));
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(system_proxy.set_calls.lock().is_empty());
        assert_eq!(lifecycle.endpoint(), None);
    }

    #[tokio::test]
    async fn unsupported_system_proxy_is_not_fatal() {
        let (engine, _spy) = ReplayEngine::new();
        let system_proxy = Arc::new(RecordingSystemProxy {
            unsupported: true,
            ..RecordingSystemProxy::default()
        });
        let lifecycle = lifecycle(engine, Arc::clone(&system_proxy));

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Listening);

        assert!(lifecycle.shutdown().await);
        // Nothing was registered, so nothing is cleared.
        assert_eq!(system_proxy.clear_calls.load(Ordering::SeqCst), 0);
    }

    // ==================== Shutdown ====================

    #[tokio::test]
    async fn shutdown_twice_clears_once() {
        let (engine, spy) = ReplayEngine::new();
        let system_proxy = Arc::new(RecordingSystemProxy::default());
        let lifecycle = lifecycle(engine, Arc::clone(&system_proxy));
        lifecycle.start().await.unwrap();

        assert!(lifecycle.shutdown().await);
        assert!(!lifecycle.shutdown().await);

        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(lifecycle.endpoint(), None);
        assert_eq!(system_proxy.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(spy.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_shutdown_runs_teardown_once() {
        let (engine, spy) = ReplayEngine::new();
        let system_proxy = Arc::new(RecordingSystemProxy::default());
        let lifecycle = Arc::new(lifecycle(engine, Arc::clone(&system_proxy)));
        lifecycle.start().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move {
                let performed = lifecycle.shutdown().await;
                // Every caller returns only after teardown finished.
                assert_eq!(lifecycle.state(), LifecycleState::Stopped);
                performed
            }));
        }

        let mut performed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                performed += 1;
            }
        }

        assert_eq!(performed, 1);
        assert_eq!(system_proxy.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(spy.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_during_registration_still_clears_proxy() {
        let (engine, spy) = ReplayEngine::new();
        let system_proxy = Arc::new(RecordingSystemProxy {
            set_delay: Some(std::time::Duration::from_millis(300)),
            ..RecordingSystemProxy::default()
        });
        let lifecycle = Arc::new(lifecycle(engine, Arc::clone(&system_proxy)));

        let starter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.start().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(lifecycle.shutdown().await);
        assert!(starter.await.unwrap().is_ok());

        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(system_proxy.set_calls.lock().len(), 1);
        assert_eq!(system_proxy.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(spy.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_failure_is_swallowed() {
        let (engine, _spy) = ReplayEngine::new();
        let system_proxy = Arc::new(RecordingSystemProxy {
            fail_clear: true,
            ..RecordingSystemProxy::default()
        });
        let lifecycle = lifecycle(engine, Arc::clone(&system_proxy));
        lifecycle.start().await.unwrap();

        assert!(lifecycle.shutdown().await);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(system_proxy.clear_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_before_start_prevents_start() {
        let (engine, spy) = ReplayEngine::new();
        let lifecycle = lifecycle(engine, Arc::new(RecordingSystemProxy::default()));

        assert!(lifecycle.shutdown().await);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState(LifecycleState::Stopped)
        ));
        assert_eq!(spy.starts.load(Ordering::SeqCst), 0);
        assert_eq!(spy.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_stopped_resolves_after_shutdown() {
        let (engine, _spy) = ReplayEngine::new();
        let lifecycle = Arc::new(lifecycle(engine, Arc::new(RecordingSystemProxy::default())));
        lifecycle.start().await.unwrap();

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_stopped().await })
        };

        lifecycle.shutdown().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
