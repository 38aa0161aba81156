//! Routing configuration.
//!
//! The configuration is a JSON document with camelCase keys:
//!
//! ```json
//! {
//!   "destinationHost": "127.0.0.1",
//!   "destinationPort": 21000,
//!   "proxyBindPort": 0,
//!   "redirectDomains": ["example.com"],
//!   "alwaysIgnoreDomains": ["cdn.example.com"],
//!   "forceRedirectOnUrlContains": ["/query_dispatch"],
//!   "blockUrls": ["/log/upload"]
//! }
//! ```
//!
//! `destinationHost` and `destinationPort` are required. Everything else
//! defaults to empty, and a `proxyBindPort` of 0 picks a random port.
//!
//! [`PolicyConfig`] is immutable once built. Domain entries are lowercased
//! and path entries are matched ASCII case-insensitively.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Bundled template written when no config file exists yet.
pub const CONFIG_TEMPLATE: &str = include_str!("../config.tmpl.json");

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// On-disk shape of the configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    destination_host: String,
    destination_port: u16,
    #[serde(default)]
    proxy_bind_port: u16,
    #[serde(default)]
    redirect_domains: Vec<String>,
    #[serde(default)]
    always_ignore_domains: Vec<String>,
    #[serde(default)]
    force_redirect_on_url_contains: Vec<String>,
    #[serde(default)]
    block_urls: Vec<String>,
}

/// Immutable routing policy shared by every hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    redirect_domains: Vec<String>,
    always_ignore_domains: Vec<String>,
    force_redirect_path_substrings: Vec<String>,
    block_paths: Vec<String>,
    destination_host: String,
    destination_port: u16,
    bind_port: u16,
}

impl PolicyConfig {
    /// Creates a policy that redirects nothing to the given backend.
    pub fn new(destination_host: impl Into<String>, destination_port: u16) -> Self {
        Self {
            redirect_domains: Vec::new(),
            always_ignore_domains: Vec::new(),
            force_redirect_path_substrings: Vec::new(),
            block_paths: Vec::new(),
            destination_host: destination_host.into().trim().to_string(),
            destination_port,
            bind_port: 0,
        }
    }

    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)?;

        let config = Self::new(file.destination_host, file.destination_port)
            .with_bind_port(file.proxy_bind_port)
            .with_redirect_domains(file.redirect_domains)
            .with_always_ignore_domains(file.always_ignore_domains)
            .with_force_redirect_paths(file.force_redirect_on_url_contains)
            .with_block_paths(file.block_urls);

        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_json(&json)?;
        tracing::debug!(
            "Loaded config from {:?}: {} redirect, {} ignore, {} force, {} block entries",
            path,
            config.redirect_domains.len(),
            config.always_ignore_domains.len(),
            config.force_redirect_path_substrings.len(),
            config.block_paths.len()
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.destination_host.is_empty() {
            return Err(ConfigError::Invalid(
                "destinationHost must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the local listen port (0 picks a random one).
    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    /// Sets the hostname suffixes eligible for redirection.
    pub fn with_redirect_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.redirect_domains = normalize_domains(domains);
        self
    }

    /// Sets the hostname suffixes that are never redirected.
    pub fn with_always_ignore_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.always_ignore_domains = normalize_domains(domains);
        self
    }

    /// Sets the path substrings that force a redirect.
    pub fn with_force_redirect_paths<I, S>(mut self, substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.force_redirect_path_substrings = normalize_paths(substrings);
        self
    }

    /// Sets the exact rewritten paths that get blocked.
    pub fn with_block_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.block_paths = normalize_paths(paths);
        self
    }

    /// Hostname suffixes eligible for redirection (lowercase).
    pub fn redirect_domains(&self) -> &[String] {
        &self.redirect_domains
    }

    /// Hostname suffixes that override redirection (lowercase).
    pub fn always_ignore_domains(&self) -> &[String] {
        &self.always_ignore_domains
    }

    /// Path substrings that force redirection (lowercase).
    pub fn force_redirect_path_substrings(&self) -> &[String] {
        &self.force_redirect_path_substrings
    }

    /// Exact paths that are blocked after rewriting (lowercase).
    pub fn block_paths(&self) -> &[String] {
        &self.block_paths
    }

    /// Backend host requests are redirected to.
    pub fn destination_host(&self) -> &str {
        &self.destination_host
    }

    /// Backend port requests are redirected to.
    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    /// Configured listen port; 0 means pick one at startup.
    pub fn bind_port(&self) -> u16 {
        self.bind_port
    }
}

fn normalize_domains<I, S>(domains: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    domains
        .into_iter()
        .map(|d| d.as_ref().trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

fn normalize_paths<I, S>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .map(|p| p.as_ref().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Creates the config file from the bundled template if it does not exist.
///
/// Returns `true` when a new file was written, in which case the operator
/// still has to edit it before the proxy does anything useful.
pub fn ensure_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, CONFIG_TEMPLATE).map_err(io_err)?;

    tracing::info!("Config file not found, created {:?} from template", path);
    Ok(true)
}
