//! Guardian launch and watch.
//!
//! The guardian is a separate process that reverts the system proxy if this
//! process dies without cleaning up. It is told our pid on its command line.
//! We watch it in turn: if it exits first, we shut down too, since nothing
//! would be left to clean up after a crash.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use detour_core::ProxyLifecycle;
use tokio::process::{Child, Command};

/// How often the guardian's exit status is polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Returns `detour-guardian` next to the running executable.
pub fn default_guardian_path() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("locating current executable")?;
    Ok(exe.with_file_name(format!(
        "detour-guardian{}",
        std::env::consts::EXE_SUFFIX
    )))
}

/// Launches the guardian watching `pid`.
pub fn spawn(path: &Path, pid: u32) -> anyhow::Result<Child> {
    let child = Command::new(path)
        .arg(pid.to_string())
        .spawn()
        .with_context(|| format!("launching guardian {:?}", path))?;

    tracing::info!(
        "Guardian started (pid {}) watching pid {}",
        child.id().unwrap_or_default(),
        pid
    );
    Ok(child)
}

/// Polls `child` every `interval` until it exits.
pub async fn wait_for_exit(child: &mut Child, interval: Duration) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Shuts the proxy down and exits the process once the guardian exits.
pub async fn watch(mut child: Child, lifecycle: Arc<ProxyLifecycle>) {
    match wait_for_exit(&mut child, POLL_INTERVAL).await {
        Ok(status) => {
            tracing::warn!("Guardian exited ({}); shutting down", status);
        }
        Err(e) => {
            tracing::warn!("Lost track of guardian: {}; shutting down", e);
        }
    }

    lifecycle.shutdown().await;
    std::process::exit(0);
}
