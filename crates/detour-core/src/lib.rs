//! Detour Core - Routing decisions, configuration, and proxy lifecycle.
//!
//! This crate decides, for every tunnel and request seen by the intercepting
//! proxy, whether traffic is decrypted, redirected to the configured backend,
//! blocked, or passed through. It has no dependency on a concrete proxy
//! engine: engines plug in through [`InterceptEngine`] and OS proxy settings
//! through [`SystemProxy`].

pub mod block;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod matcher;
pub mod rewrite;
pub mod routing;
pub mod system_proxy;

pub use block::should_block;
pub use config::{ensure_config, PolicyConfig, CONFIG_TEMPLATE, DEFAULT_CONFIG_PATH};
pub use engine::{
    CertValidationHook, CertificateCheck, HookSet, InterceptEngine, RequestAction, RequestHead,
    RequestHook, SyntheticResponse, TunnelHook, BLOCKED_BODY,
};
pub use error::{ConfigError, EngineError, LifecycleError, Result, SystemProxyError};
pub use lifecycle::{resolve_bind_port, LifecycleState, ProxyLifecycle};
pub use matcher::{normalize_host, should_force_redirect, should_redirect};
pub use rewrite::{rewrite, RedirectTarget};
pub use routing::{RouteDecision, RoutingPolicy};
pub use system_proxy::{ManualSystemProxy, SystemProxy};
