//! Redirect URL construction.
//!
//! A rewritten URL keeps the original path and query byte-for-byte and swaps
//! scheme, host and port for `http://{host}:{port}`. The backend is always
//! spoken to in plain HTTP, even when the client used HTTPS. HTTP request
//! targets never carry a fragment, so path and query are the whole tail.

use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;

use crate::error::ConfigError;

/// The backend every redirected request is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    authority: Authority,
}

impl RedirectTarget {
    /// Builds a target from a host (name, IPv4 or IPv6) and port.
    pub fn new(host: &str, port: u16) -> Result<Self, ConfigError> {
        let host = host.trim();
        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let authority = authority
            .parse::<Authority>()
            .map_err(|e| ConfigError::Invalid(format!("destination {}: {}", authority, e)))?;

        Ok(Self { authority })
    }

    /// Returns the `host:port` authority of the backend.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Returns the backend base URL, `http://host:port/`.
    pub fn base_url(&self) -> String {
        format!("http://{}/", self.authority)
    }
}

/// Rewrites `original` to point at `target`.
///
/// # Examples
///
/// ```
/// use detour_core::{rewrite, RedirectTarget};
///
/// let target = RedirectTarget::new("10.0.0.5", 8080).unwrap();
/// let original = "https://game.example.com/login?x=1".parse().unwrap();
///
/// let rewritten = rewrite(&original, &target).unwrap();
/// assert_eq!(rewritten.to_string(), "http://10.0.0.5:8080/login?x=1");
/// ```
pub fn rewrite(original: &Uri, target: &RedirectTarget) -> Result<Uri, http::Error> {
    let path_and_query = original
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(target.authority.clone())
        .path_and_query(path_and_query)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RedirectTarget {
        RedirectTarget::new("10.0.0.5", 8080).unwrap()
    }

    fn rewrite_str(url: &str) -> String {
        rewrite(&url.parse().unwrap(), &target()).unwrap().to_string()
    }

    #[test]
    fn rewrites_https_to_plain_http_backend() {
        assert_eq!(
            rewrite_str("https://game.example.com/login?x=1"),
            "http://10.0.0.5:8080/login?x=1"
        );
    }

    #[test]
    fn rewrites_http_and_explicit_ports() {
        assert_eq!(
            rewrite_str("http://game.example.com:8443/a/b"),
            "http://10.0.0.5:8080/a/b"
        );
    }

    #[test]
    fn preserves_encoded_path_and_query_exactly() {
        let tail = "/query%20dispatch/%E2%9C%93;v=1?version=CN%2F1.0&a=&b=%3D";
        let rewritten = rewrite(
            &format!("https://sdk.example.com{}", tail).parse().unwrap(),
            &target(),
        )
        .unwrap();

        assert_eq!(rewritten.path_and_query().unwrap().as_str(), tail);
        assert_eq!(rewritten.scheme(), Some(&Scheme::HTTP));
        assert_eq!(rewritten.host(), Some("10.0.0.5"));
        assert_eq!(rewritten.port_u16(), Some(8080));
    }

    #[test]
    fn empty_path_becomes_root() {
        assert_eq!(rewrite_str("https://game.example.com"), "http://10.0.0.5:8080/");
    }

    #[test]
    fn origin_form_target_is_rewritten() {
        assert_eq!(rewrite_str("/status?full=1"), "http://10.0.0.5:8080/status?full=1");
    }

    #[test]
    fn ipv6_destination_is_bracketed() {
        let target = RedirectTarget::new("::1", 21000).unwrap();
        let rewritten = rewrite(&"https://a.test/x".parse().unwrap(), &target).unwrap();
        assert_eq!(rewritten.to_string(), "http://[::1]:21000/x");
    }

    #[test]
    fn hostname_destination() {
        let target = RedirectTarget::new("backend.local", 80).unwrap();
        assert_eq!(target.base_url(), "http://backend.local:80/");
    }

    #[test]
    fn invalid_destination_is_rejected() {
        assert!(RedirectTarget::new("bad host", 80).is_err());
        assert!(RedirectTarget::new("a/b", 80).is_err());
    }
}
