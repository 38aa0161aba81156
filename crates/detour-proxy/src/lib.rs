//! Detour Proxy - hudsucker-based intercepting engine.
//!
//! This crate provides the production [`InterceptEngine`](detour_core::InterceptEngine)
//! for Detour: a local forward proxy that terminates TLS for the hosts the
//! routing policy selects and hands every request to the policy's hooks.
//!
//! ## Features
//!
//! - Generates root CA certificate on first run
//! - Creates per-host certificates on the fly
//! - Decrypts only the hosts the tunnel hook selects (opaque tunnel otherwise)
//! - Retargets redirected requests at the backend, `Host` header included
//! - Answers blocked requests with `404 Resource Blocked`
//! - Validates upstream certificates through the certificate hook
//!
//! ## Architecture
//!
//! ```text
//! Client → Proxy ─ CONNECT host ─► tunnel hook ─ no ─► opaque tunnel
//!                                       │ yes
//!                                       ▼
//!                              TLS with CA-signed leaf
//!                                       │
//!          plain HTTP request ──────────┤
//!                                       ▼
//!                                  request hook
//!                    ┌──────────────────┼──────────────────┐
//!                    ▼                  ▼                  ▼
//!                 Forward      Redirect to backend    404 response
//!                    │                  │
//!                    └────────┬─────────┘
//!                             ▼
//!                  upstream (cert hook)
//! ```

mod ca;
mod error;
mod handler;
mod proxy;
mod verifier;

pub use ca::{CaManager, CaManagerError};
pub use error::{ProxyError, Result};
pub use handler::RoutingHandler;
pub use proxy::{HudsuckerEngine, DEFAULT_SHUTDOWN_TIMEOUT};
pub use verifier::{https_connector, upstream_tls_config, HookedCertVerifier};
