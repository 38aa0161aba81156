//! Hostname and path matching.
//!
//! Domain entries are plain string suffixes: `example.com` matches
//! `api.example.com`, but also `notexample.com`. Matching is not aware of
//! label boundaries. The ignore list always wins over the redirect list.

use crate::config::PolicyConfig;

/// Strips a `:port` suffix (everything from the first `:`) and lowercases.
pub fn normalize_host(hostname: &str) -> String {
    let host = match hostname.find(':') {
        Some(idx) => &hostname[..idx],
        None => hostname,
    };
    host.to_ascii_lowercase()
}

/// Returns whether traffic for `hostname` should be redirected.
///
/// # Examples
///
/// ```
/// use detour_core::{should_redirect, PolicyConfig};
///
/// let config = PolicyConfig::new("10.0.0.5", 8080)
///     .with_redirect_domains(["example.com"])
///     .with_always_ignore_domains(["cdn.example.com"]);
///
/// assert!(should_redirect("api.example.com:443", &config));
/// assert!(!should_redirect("cdn.example.com", &config));
/// assert!(!should_redirect("example.org", &config));
/// ```
pub fn should_redirect(hostname: &str, config: &PolicyConfig) -> bool {
    let host = normalize_host(hostname);
    if host.is_empty() {
        return false;
    }

    if let Some(domain) = config
        .always_ignore_domains()
        .iter()
        .find(|d| host.ends_with(d.as_str()))
    {
        tracing::debug!("Hostname {} matches ignore domain {}", host, domain);
        return false;
    }

    if let Some(domain) = config
        .redirect_domains()
        .iter()
        .find(|d| host.ends_with(d.as_str()))
    {
        tracing::debug!("Hostname {} matches redirect domain {}", host, domain);
        return true;
    }

    false
}

/// Returns whether `path` contains a force-redirect keyword.
pub fn should_force_redirect(path: &str, config: &PolicyConfig) -> bool {
    let substrings = config.force_redirect_path_substrings();
    if substrings.is_empty() {
        return false;
    }

    let lowered = path.to_ascii_lowercase();
    match substrings.iter().find(|k| lowered.contains(k.as_str())) {
        Some(keyword) => {
            tracing::debug!("Path {} matches force redirect keyword {}", path, keyword);
            true
        }
        None => false,
    }
}
