//! Capability interface for the intercepting proxy engine.
//!
//! The routing policy only ever talks to an engine through the three hook
//! points declared here plus `start`/`stop`. The production engine lives in
//! `detour-proxy`; tests substitute a double that replays canned hostnames
//! and requests without opening sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header, HeaderMap, Method, StatusCode, Uri};

use crate::error::EngineError;

/// Body of the synthetic response served for blocked requests.
pub const BLOCKED_BODY: &str = "Resource Blocked";

/// Tunnel-phase hook: hostname of a CONNECT target -> decrypt it?
pub type TunnelHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Request-phase hook: request head -> what the engine should do with it.
pub type RequestHook = Arc<dyn Fn(&RequestHead<'_>) -> RequestAction + Send + Sync>;

/// Certificate hook: upstream certificate and its validation errors -> accept?
pub type CertValidationHook = Arc<dyn Fn(&CertificateCheck<'_>) -> bool + Send + Sync>;

/// Borrowed view of an HTTP request as seen by the request hook.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    /// Request method.
    pub method: &'a Method,
    /// Request target, absolute-form for proxied and decrypted requests.
    pub uri: &'a Uri,
    /// Request headers.
    pub headers: &'a HeaderMap,
}

impl<'a> RequestHead<'a> {
    /// Creates a request head.
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// Target host, from the URI or else the `Host` header (port stripped).
    pub fn host(&self) -> Option<&'a str> {
        if let Some(host) = self.uri.host() {
            return Some(host);
        }

        self.headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(':').next().unwrap_or(s))
            .filter(|s| !s.is_empty())
    }
}

/// Synthetic response served in place of forwarding a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    /// Status code to send.
    pub status: StatusCode,
    /// Plain-text body.
    pub body: &'static str,
}

impl SyntheticResponse {
    /// The `404 Resource Blocked` response for blocked paths.
    pub fn blocked() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: BLOCKED_BODY,
        }
    }
}

/// What the engine should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Forward the request unchanged.
    Forward,
    /// Replace the request target with this URL and forward it.
    Redirect(Uri),
    /// Answer the client directly; nothing goes upstream.
    Respond(SyntheticResponse),
}

/// Upstream certificate presented to the certificate hook.
#[derive(Debug, Clone, Copy)]
pub struct CertificateCheck<'a> {
    /// Server name the client connected to.
    pub server_name: &'a str,
    /// DER-encoded end-entity certificate.
    pub certificate_der: &'a [u8],
    /// Validation errors reported by the TLS stack; empty when valid.
    pub errors: &'a [String],
}

/// The hooks an engine consults. Unset hooks behave as: never decrypt,
/// forward everything, accept only certificates without errors.
#[derive(Clone, Default)]
pub struct HookSet {
    /// Tunnel-phase hook.
    pub tunnel: Option<TunnelHook>,
    /// Request-phase hook.
    pub request: Option<RequestHook>,
    /// Certificate-validation hook.
    pub cert_validation: Option<CertValidationHook>,
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("tunnel", &self.tunnel.is_some())
            .field("request", &self.request.is_some())
            .field("cert_validation", &self.cert_validation.is_some())
            .finish()
    }
}

impl HookSet {
    /// Runs the tunnel hook.
    pub fn should_intercept(&self, hostname: &str) -> bool {
        self.tunnel.as_ref().is_some_and(|hook| hook(hostname))
    }

    /// Runs the request hook.
    pub fn route_request(&self, head: &RequestHead<'_>) -> RequestAction {
        match &self.request {
            Some(hook) => hook(head),
            None => RequestAction::Forward,
        }
    }

    /// Runs the certificate hook.
    pub fn accept_certificate(&self, check: &CertificateCheck<'_>) -> bool {
        match &self.cert_validation {
            Some(hook) => hook(check),
            None => check.errors.is_empty(),
        }
    }
}

/// A TLS-intercepting proxy engine the routing policy can be plugged into.
#[async_trait]
pub trait InterceptEngine: Send {
    /// Installs the tunnel-phase hook.
    fn register_tunnel_hook(&mut self, hook: TunnelHook);

    /// Installs the request-phase hook.
    fn register_request_hook(&mut self, hook: RequestHook);

    /// Installs the upstream certificate-validation hook.
    fn register_cert_validation_hook(&mut self, hook: CertValidationHook);

    /// Binds `addr`, starts accepting, and returns the bound address.
    async fn start(&mut self, addr: SocketAddr) -> Result<SocketAddr, EngineError>;

    /// Stops accepting and drains the engine. Must tolerate repeated calls.
    async fn stop(&mut self);
}
