//! Per-tunnel and per-request routing decisions.
//!
//! ```text
//! CONNECT host ──► should_redirect(host)? ──no──► opaque tunnel
//!                         │ yes
//!                         ▼
//!                  decrypt (MITM)
//!                         │
//! request ──► should_redirect(host) || should_force_redirect(path)?
//!                         │ no ──► forward unchanged
//!                         ▼ yes
//!                  rewrite to backend
//!                         │
//!             should_block(rewritten)? ──yes──► 404 Resource Blocked
//!                         │ no
//!                         ▼
//!               forward rewritten request
//! ```
//!
//! Everything here is a pure function of the immutable [`PolicyConfig`] and
//! the per-call input, so the hooks are safe to run concurrently.

use std::sync::Arc;

use http::{Method, Uri};

use crate::block::should_block;
use crate::config::PolicyConfig;
use crate::engine::{
    CertValidationHook, CertificateCheck, HookSet, RequestAction, RequestHead, RequestHook,
    SyntheticResponse, TunnelHook,
};
use crate::error::ConfigError;
use crate::matcher::{should_force_redirect, should_redirect};
use crate::rewrite::{rewrite, RedirectTarget};

/// Routing outcome for a single request. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDecision {
    /// Whether the request is eligible for redirection.
    pub should_redirect: bool,
    /// Backend URL, present when the request was redirected.
    pub rewritten_url: Option<Uri>,
    /// Whether the rewritten request must be answered with a block response.
    pub should_block: bool,
}

impl RouteDecision {
    /// A decision that leaves the request untouched.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Converts the decision into the engine action.
    pub fn action(&self) -> RequestAction {
        if self.should_block {
            return RequestAction::Respond(SyntheticResponse::blocked());
        }
        match &self.rewritten_url {
            Some(url) if self.should_redirect => RequestAction::Redirect(url.clone()),
            _ => RequestAction::Forward,
        }
    }
}

/// The routing policy plugged into the engine's hooks.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    config: PolicyConfig,
    target: RedirectTarget,
}

impl RoutingPolicy {
    /// Creates a policy, validating the redirect destination.
    pub fn new(config: PolicyConfig) -> Result<Self, ConfigError> {
        let target = RedirectTarget::new(config.destination_host(), config.destination_port())?;
        Ok(Self { config, target })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Returns the redirect destination.
    pub fn target(&self) -> &RedirectTarget {
        &self.target
    }

    /// Tunnel phase: whether to terminate TLS for `hostname`.
    pub fn intercept_tls(&self, hostname: &str) -> bool {
        tracing::debug!("Received tunnel request for hostname: {}", hostname);

        let decrypt = should_redirect(hostname, &self.config);
        if decrypt {
            tracing::info!("TLS decryption enabled for hostname: {}", hostname);
        }
        decrypt
    }

    /// Request phase: decides what happens to a request for `host` at `uri`.
    pub fn decide(&self, host: &str, uri: &Uri) -> RouteDecision {
        tracing::debug!("Processing request to hostname: {}", host);

        let eligible =
            should_redirect(host, &self.config) || should_force_redirect(uri.path(), &self.config);
        if !eligible {
            return RouteDecision::passthrough();
        }

        let rewritten = match rewrite(uri, &self.target) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                tracing::warn!("Failed to rewrite {}: {}; forwarding unchanged", uri, e);
                return RouteDecision::passthrough();
            }
        };

        let blocked = should_block(&rewritten, &self.config);
        if blocked {
            tracing::warn!("Blocking redirected URL: {}", rewritten);
        } else {
            tracing::info!("Redirecting URL from {} to {}", uri, rewritten);
        }

        RouteDecision {
            should_redirect: true,
            rewritten_url: Some(rewritten),
            should_block: blocked,
        }
    }

    /// Request-phase hook body.
    ///
    /// CONNECT requests are left alone here; their fate is decided by
    /// [`intercept_tls`](Self::intercept_tls).
    pub fn route_request(&self, head: &RequestHead<'_>) -> RequestAction {
        if head.method == Method::CONNECT {
            return RequestAction::Forward;
        }

        let host = head.host().unwrap_or_default();
        self.decide(host, head.uri).action()
    }

    /// Certificate hook body: accept iff the TLS stack reported no errors.
    pub fn accept_certificate(&self, check: &CertificateCheck<'_>) -> bool {
        if check.errors.is_empty() {
            tracing::debug!("Certificate validation succeeded for: {}", check.server_name);
            true
        } else {
            tracing::warn!(
                "Certificate validation failed for {} with errors: {}",
                check.server_name,
                check.errors.join(", ")
            );
            false
        }
    }

    /// Builds the three engine hooks backed by this policy.
    pub fn hooks(self: &Arc<Self>) -> HookSet {
        let policy = Arc::clone(self);
        let tunnel: TunnelHook = Arc::new(move |host: &str| policy.intercept_tls(host));

        let policy = Arc::clone(self);
        let request: RequestHook =
            Arc::new(move |head: &RequestHead<'_>| policy.route_request(head));

        let policy = Arc::clone(self);
        let cert_validation: CertValidationHook =
            Arc::new(move |check: &CertificateCheck<'_>| policy.accept_certificate(check));

        HookSet {
            tunnel: Some(tunnel),
            request: Some(request),
            cert_validation: Some(cert_validation),
        }
    }
}
