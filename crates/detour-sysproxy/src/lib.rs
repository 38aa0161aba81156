//! Detour SysProxy - OS-wide HTTP/HTTPS proxy registration.
//!
//! Handles:
//! - Pointing the system proxy at the local endpoint
//! - Reverting it on shutdown (also used by the guardian)
//! - Reading the current system proxy for the startup check
//!
//! Windows writes the per-user Internet Settings registry key and tells
//! WinINet to reload it. macOS drives `networksetup` on the active network
//! service. Linux drives GNOME `gsettings`; desktops without it report
//! [`SystemProxyError::Unsupported`].

use std::net::SocketAddr;
#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::process::Command;

use detour_core::{SystemProxy, SystemProxyError};

/// [`SystemProxy`] backed by the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSystemProxy;

impl OsSystemProxy {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self
    }
}

impl SystemProxy for OsSystemProxy {
    fn set_system_proxy(&self, endpoint: SocketAddr) -> Result<(), SystemProxyError> {
        enable_system_proxy(endpoint)
    }

    fn clear_system_proxy(&self) -> Result<(), SystemProxyError> {
        disable_system_proxy()
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Points the OS HTTP and HTTPS proxy at `endpoint`.
pub fn enable_system_proxy(endpoint: SocketAddr) -> Result<(), SystemProxyError> {
    #[cfg(target_os = "windows")]
    {
        enable_proxy_windows(endpoint)
    }

    #[cfg(target_os = "macos")]
    {
        enable_proxy_macos(endpoint)
    }

    #[cfg(target_os = "linux")]
    {
        enable_proxy_linux(endpoint)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = endpoint;
        Err(SystemProxyError::Unsupported(
            "unsupported operating system".to_string(),
        ))
    }
}

/// Disables the OS proxy setting.
pub fn disable_system_proxy() -> Result<(), SystemProxyError> {
    #[cfg(target_os = "windows")]
    {
        disable_proxy_windows()
    }

    #[cfg(target_os = "macos")]
    {
        disable_proxy_macos()
    }

    #[cfg(target_os = "linux")]
    {
        disable_proxy_linux()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Err(SystemProxyError::Unsupported(
            "unsupported operating system".to_string(),
        ))
    }
}

/// Returns the currently active system proxy as `host:port`, if any.
pub fn current_system_proxy() -> Result<Option<String>, SystemProxyError> {
    #[cfg(target_os = "windows")]
    {
        current_proxy_windows()
    }

    #[cfg(target_os = "macos")]
    {
        current_proxy_macos()
    }

    #[cfg(target_os = "linux")]
    {
        current_proxy_linux()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Ok(None)
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(target_os = "windows")]
const INTERNET_SETTINGS: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

#[cfg(target_os = "windows")]
fn open_internet_settings() -> Result<winreg::RegKey, SystemProxyError> {
    use winreg::enums::*;
    use winreg::RegKey;

    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    hkcu.open_subkey_with_flags(INTERNET_SETTINGS, KEY_READ | KEY_WRITE)
        .map_err(|e| SystemProxyError::Command(format!("open Internet Settings: {}", e)))
}

#[cfg(target_os = "windows")]
fn enable_proxy_windows(endpoint: SocketAddr) -> Result<(), SystemProxyError> {
    let key = open_internet_settings()?;

    key.set_value("ProxyServer", &wininet_proxy_server(endpoint))?;
    key.set_value("ProxyOverride", &"<local>".to_string())?;
    key.set_value("ProxyEnable", &1u32)?;

    refresh_wininet();
    Ok(())
}

#[cfg(target_os = "windows")]
fn disable_proxy_windows() -> Result<(), SystemProxyError> {
    let key = open_internet_settings()?;
    key.set_value("ProxyEnable", &0u32)?;

    refresh_wininet();
    Ok(())
}

#[cfg(target_os = "windows")]
fn current_proxy_windows() -> Result<Option<String>, SystemProxyError> {
    let key = open_internet_settings()?;

    let enabled: u32 = key.get_value("ProxyEnable").unwrap_or(0);
    if enabled == 0 {
        return Ok(None);
    }

    let server: String = key.get_value("ProxyServer").unwrap_or_default();
    Ok(Some(server).filter(|s| !s.trim().is_empty()))
}

/// Makes running WinINet clients pick up the registry change.
#[cfg(target_os = "windows")]
fn refresh_wininet() {
    use windows_sys::Win32::Networking::WinInet::{
        InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
    };

    // SAFETY: both options take no buffer and a null handle means global.
    unsafe {
        InternetSetOptionW(
            std::ptr::null(),
            INTERNET_OPTION_SETTINGS_CHANGED,
            std::ptr::null(),
            0,
        );
        InternetSetOptionW(std::ptr::null(), INTERNET_OPTION_REFRESH, std::ptr::null(), 0);
    }
}

/// `ProxyServer` registry value routing both schemes to `endpoint`.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn wininet_proxy_server(endpoint: SocketAddr) -> String {
    format!("http={0};https={0}", endpoint)
}

// ============================================================================
// macOS Implementation
// ============================================================================

#[cfg(target_os = "macos")]
fn get_active_network_service() -> Option<String> {
    let output = Command::new("networksetup")
        .args(["-listallnetworkservices"])
        .output()
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    for service in ["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN"] {
        if stdout.lines().any(|line| line == service) {
            return Some(service.to_string());
        }
    }

    // First enabled service; disabled ones are prefixed with '*'.
    stdout
        .lines()
        .skip(1)
        .find(|line| !line.starts_with('*') && !line.trim().is_empty())
        .map(|s| s.to_string())
}

#[cfg(target_os = "macos")]
fn networksetup(args: &[&str]) -> Result<String, SystemProxyError> {
    let output = Command::new("networksetup").args(args).output()?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SystemProxyError::Command(format!(
            "networksetup {}: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(target_os = "macos")]
fn active_service() -> Result<String, SystemProxyError> {
    get_active_network_service()
        .ok_or_else(|| SystemProxyError::Command("no active network service".to_string()))
}

#[cfg(target_os = "macos")]
fn enable_proxy_macos(endpoint: SocketAddr) -> Result<(), SystemProxyError> {
    let service = active_service()?;
    let host = endpoint.ip().to_string();
    let port = endpoint.port().to_string();

    networksetup(&["-setwebproxy", &service, &host, &port])?;
    networksetup(&["-setsecurewebproxy", &service, &host, &port])?;
    networksetup(&["-setwebproxystate", &service, "on"])?;
    networksetup(&["-setsecurewebproxystate", &service, "on"])?;

    tracing::debug!("System proxy enabled on {}", service);
    Ok(())
}

#[cfg(target_os = "macos")]
fn disable_proxy_macos() -> Result<(), SystemProxyError> {
    let service = active_service()?;

    networksetup(&["-setwebproxystate", &service, "off"])?;
    networksetup(&["-setsecurewebproxystate", &service, "off"])?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn current_proxy_macos() -> Result<Option<String>, SystemProxyError> {
    let service = active_service()?;

    for flag in ["-getwebproxy", "-getsecurewebproxy"] {
        let stdout = networksetup(&[flag, &service])?;
        if let Some(proxy) = parse_networksetup_proxy(&stdout) {
            return Ok(Some(proxy));
        }
    }
    Ok(None)
}

/// Parses `networksetup -getwebproxy` output into `host:port` when enabled.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_networksetup_proxy(stdout: &str) -> Option<String> {
    let mut enabled = false;
    let mut server = None;
    let mut port = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => enabled = value.eq_ignore_ascii_case("yes"),
            "Server" if !value.is_empty() => server = Some(value.to_string()),
            "Port" => port = value.parse::<u16>().ok(),
            _ => {}
        }
    }

    if !enabled {
        return None;
    }
    match (server, port) {
        (Some(server), Some(port)) => Some(format!("{}:{}", server, port)),
        (Some(server), None) => Some(server),
        _ => None,
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
fn gsettings(args: &[&str]) -> Result<String, SystemProxyError> {
    let output = match Command::new("gsettings").args(args).output() {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SystemProxyError::Unsupported(
                "gsettings not found (only GNOME desktops are supported)".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SystemProxyError::Command(format!(
            "gsettings {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(target_os = "linux")]
fn enable_proxy_linux(endpoint: SocketAddr) -> Result<(), SystemProxyError> {
    let host = endpoint.ip().to_string();
    let port = endpoint.port().to_string();

    for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
        gsettings(&["set", schema, "host", &host])?;
        gsettings(&["set", schema, "port", &port])?;
    }
    gsettings(&["set", "org.gnome.system.proxy", "mode", "manual"])?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn disable_proxy_linux() -> Result<(), SystemProxyError> {
    gsettings(&["set", "org.gnome.system.proxy", "mode", "none"])?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn current_proxy_linux() -> Result<Option<String>, SystemProxyError> {
    match gsettings(&["get", "org.gnome.system.proxy", "mode"]) {
        Ok(mode) if unquote_gsettings(&mode) == "manual" => {
            let host = gsettings(&["get", "org.gnome.system.proxy.http", "host"])?;
            let port = gsettings(&["get", "org.gnome.system.proxy.http", "port"])?;
            let host = unquote_gsettings(&host);
            if !host.is_empty() {
                return Ok(Some(format!("{}:{}", host, port.trim())));
            }
        }
        Ok(_) | Err(SystemProxyError::Unsupported(_)) => {}
        Err(e) => return Err(e),
    }

    Ok(std::env::var("https_proxy")
        .or_else(|_| std::env::var("HTTPS_PROXY"))
        .or_else(|_| std::env::var("http_proxy"))
        .or_else(|_| std::env::var("HTTP_PROXY"))
        .ok()
        .filter(|v| !v.trim().is_empty()))
}

/// Strips the quotes GVariant puts around string values.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unquote_gsettings(value: &str) -> &str {
    value.trim().trim_matches('\'')
}

// ============================================================================
// Tests
// ============================================================================
