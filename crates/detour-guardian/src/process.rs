//! Process liveness checks by pid.

/// Returns whether a process with `pid` is currently running.
pub fn is_alive(pid: u32) -> bool {
    #[cfg(target_os = "windows")]
    {
        is_alive_windows(pid)
    }

    #[cfg(target_os = "linux")]
    {
        is_alive_linux(pid)
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        is_alive_unix(pid)
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    {
        let _ = pid;
        false
    }
}

#[cfg(target_os = "windows")]
fn is_alive_windows(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, WAIT_TIMEOUT};
    use windows_sys::Win32::System::Threading::{
        OpenProcess, WaitForSingleObject, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
    };

    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let handle = OpenProcess(
            PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_SYNCHRONIZE,
            0,
            pid,
        );
        if handle.is_null() {
            return false;
        }

        // A process handle is signaled once the process has exited.
        let alive = WaitForSingleObject(handle, 0) == WAIT_TIMEOUT;
        CloseHandle(handle);
        alive
    }
}

#[cfg(target_os = "linux")]
fn is_alive_linux(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !is_zombie(&stat),
        Err(_) => false,
    }
}

/// Zombies have exited but linger until reaped.
#[cfg(target_os = "linux")]
fn is_zombie(stat: &str) -> bool {
    // The command name may contain spaces and parens; the state follows the
    // last ')'.
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_alive_unix(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
