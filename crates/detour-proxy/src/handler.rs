//! hudsucker HTTP handler that applies the routing hooks.
//!
//! `should_intercept` answers the tunnel hook for each CONNECT; requests
//! (plain HTTP, and HTTPS once decrypted) go through the request hook and
//! are forwarded, retargeted at the backend, or answered locally.

use std::future::Future;

use http_body_util::Full;
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::Uri;

use detour_core::{HookSet, RequestAction, RequestHead, SyntheticResponse};

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// HTTP handler for the intercepting engine.
#[derive(Clone, Debug, Default)]
pub struct RoutingHandler {
    hooks: HookSet,
}

impl RoutingHandler {
    /// Creates a handler over the given hooks.
    pub fn new(hooks: HookSet) -> Self {
        Self { hooks }
    }

    /// Runs the request hook and applies its verdict.
    pub fn route(&self, req: Request<Body>) -> RequestOrResponse {
        let action = {
            let head = RequestHead::new(req.method(), req.uri(), req.headers());
            self.hooks.route_request(&head)
        };
        apply_action(req, action)
    }

    /// Runs the tunnel hook for a CONNECT request.
    pub fn intercept(&self, req: &Request<Body>) -> bool {
        match tunnel_host(req) {
            Some(host) => self.hooks.should_intercept(&host),
            None => false,
        }
    }
}

/// Host named by a CONNECT request target, else by its `Host` header.
fn tunnel_host(req: &Request<Body>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }

    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

/// Applies a routing verdict to a request.
fn apply_action(mut req: Request<Body>, action: RequestAction) -> RequestOrResponse {
    match action {
        RequestAction::Forward => RequestOrResponse::Request(req),
        RequestAction::Redirect(target) => {
            retarget(&mut req, target);
            RequestOrResponse::Request(req)
        }
        RequestAction::Respond(response) => {
            RequestOrResponse::Response(synthetic_response(&response))
        }
    }
}

/// Points the request at `target`, keeping the `Host` header consistent.
fn retarget(req: &mut Request<Body>, target: Uri) {
    if let Some(authority) = target.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            req.headers_mut().insert(HOST, value);
        }
    }
    *req.uri_mut() = target;
}

/// Builds the plain-text response for a synthetic verdict.
fn synthetic_response(synthetic: &SyntheticResponse) -> Response<Body> {
    let mut response = Response::new(bytes_to_body(Bytes::from_static(
        synthetic.body.as_bytes(),
    )));
    *response.status_mut() = synthetic.status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

impl HttpHandler for RoutingHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        self.route(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        res
    }

    fn should_intercept(
        &mut self,
        _ctx: &HttpContext,
        req: &Request<Body>,
    ) -> impl Future<Output = bool> + Send {
        let decrypt = self.intercept(req);
        async move { decrypt }
    }
}
