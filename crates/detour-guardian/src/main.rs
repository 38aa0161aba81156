//! Detour Guardian - reverts the system proxy when Detour dies.
//!
//! Usage: `detour-guardian <pid>`
//!
//! Polls the watched process once a second. When it is gone (or was never
//! found), the system proxy is disabled so a crashed Detour does not leave
//! the machine pointing at a dead proxy.
//!
//! Exit codes: 0 after the watched process exited, 1 on bad usage,
//! 2 if the watched process could not be found.

mod process;

use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// How often the watched process is checked.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Guardian failures, each mapped to a process exit code.
#[derive(Debug, Error)]
enum GuardianError {
    /// Missing or malformed pid argument.
    #[error("usage: detour-guardian <pid> ({0})")]
    Usage(String),

    /// No process with the given pid was running at startup.
    #[error("process {0} not found")]
    NotFound(u32),
}

impl GuardianError {
    fn exit_code(&self) -> i32 {
        match self {
            GuardianError::Usage(_) => 1,
            GuardianError::NotFound(_) => 2,
        }
    }
}

/// Parses the single pid argument.
fn parse_pid<I>(mut args: I) -> Result<u32, GuardianError>
where
    I: Iterator<Item = String>,
{
    let arg = args
        .next()
        .ok_or_else(|| GuardianError::Usage("missing pid".to_string()))?;

    if args.next().is_some() {
        return Err(GuardianError::Usage("too many arguments".to_string()));
    }

    arg.trim()
        .parse::<u32>()
        .map_err(|e| GuardianError::Usage(format!("invalid pid {:?}: {}", arg, e)))
}

fn clear_proxy() {
    match detour_sysproxy::disable_system_proxy() {
        Ok(()) => tracing::info!("System proxy disabled"),
        Err(e) => tracing::warn!("Failed to disable system proxy: {}", e),
    }
}

/// Blocks while `is_alive(pid)` holds, checking every `interval`.
fn wait_while_alive(pid: u32, interval: Duration, is_alive: impl Fn(u32) -> bool) {
    while is_alive(pid) {
        std::thread::sleep(interval);
    }
}

fn run<I>(args: I) -> Result<(), GuardianError>
where
    I: Iterator<Item = String>,
{
    let pid = parse_pid(args)?;

    if !process::is_alive(pid) {
        tracing::warn!("Process {} not found; disabling system proxy", pid);
        clear_proxy();
        return Err(GuardianError::NotFound(pid));
    }

    tracing::info!("Watching process {}", pid);
    wait_while_alive(pid, POLL_INTERVAL, process::is_alive);

    tracing::warn!("Process {} exited; disabling system proxy", pid);
    clear_proxy();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match run(std::env::args().skip(1)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn parses_pid() {
        assert_eq!(parse_pid(args(&["4242"])).unwrap(), 4242);
        assert_eq!(parse_pid(args(&[" 17 "])).unwrap(), 17);
    }

    #[test]
    fn rejects_bad_usage() {
        for bad in [&[][..], &["abc"][..], &["-5"][..], &["1", "2"][..]] {
            let err = parse_pid(args(bad)).unwrap_err();
            assert!(matches!(err, GuardianError::Usage(_)));
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[test]
    fn not_found_exit_code() {
        assert_eq!(GuardianError::NotFound(7).exit_code(), 2);
    }

    #[test]
    fn usage_error_runs_nothing() {
        assert!(matches!(run(args(&[])), Err(GuardianError::Usage(_))));
    }

    #[test]
    fn waits_until_process_disappears() {
        let checks = Cell::new(0);
        wait_while_alive(99, Duration::from_millis(1), |pid| {
            assert_eq!(pid, 99);
            checks.set(checks.get() + 1);
            checks.get() < 3
        });
        assert_eq!(checks.get(), 3);
    }
}
