//! A pidfile-based "is the daemon running" check, used by `overlord halt` to
//! find and stop a daemon process started elsewhere. The daemon's own
//! shutdown (SIGINT/SIGTERM → the `run` loop's shutdown event) is
//! independent of this file; it only exists so a *second* invocation of the
//! CLI can locate the first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

pub fn pid_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("daemon.pid")
}

/// Writes the current process's pid to `<state_dir>/daemon.pid`.
pub fn write_pid_file(state_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    std::fs::write(pid_file_path(state_dir), std::process::id().to_string())
}

pub fn remove_pid_file(state_dir: &Path) {
    let _ = std::fs::remove_file(pid_file_path(state_dir));
}

/// Returns the pid recorded in the pidfile if that process is still alive.
/// A stale pidfile (process gone) is treated as "not running".
pub async fn check_running(state_dir: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(pid_file_path(state_dir)).ok()?;
    let pid: u32 = contents.trim().parse().ok()?;
    if process_alive(pid).await {
        Some(pid)
    } else {
        None
    }
}

async fn process_alive(pid: u32) -> bool {
    matches!(
        Command::new("kill").args(["-0", &pid.to_string()]).output().await,
        Ok(output) if output.status.success()
    )
}

/// Sends SIGTERM to the recorded daemon pid and polls for exit up to
/// `timeout`. Returns `true` if the process was observed to stop.
pub async fn stop_daemon(state_dir: &Path, timeout: Duration) -> bool {
    let Some(pid) = check_running(state_dir).await else {
        return false;
    };

    let _ = Command::new("kill").args(["-TERM", &pid.to_string()]).output().await;

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid).await {
            remove_pid_file(state_dir);
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_running_none_without_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_running(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn check_running_none_for_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(pid_file_path(dir.path()), "999999999").unwrap();
        assert!(check_running(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn write_pid_file_roundtrips_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        let running = check_running(dir.path()).await;
        assert_eq!(running, Some(std::process::id()));
        remove_pid_file(dir.path());
        assert!(check_running(dir.path()).await.is_none());
    }
}
