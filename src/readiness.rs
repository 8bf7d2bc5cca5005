//! Readiness markers shared with the launcher and the kubelet probes.
//!
//! Readiness is signalled by the existence of a file; its content is
//! irrelevant.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Interval between launcher readiness checks.
pub const LAUNCHER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Whether `path` exists.
///
/// A missing file is `Ok(false)`; any other stat failure is an error.
pub fn file_exists(path: &Path) -> io::Result<bool> {
    path.try_exists()
}

/// Wait for the launcher's readiness marker.
///
/// Sleeps `interval` before every check and performs at most `budget`
/// checks. Fails on the first stat error or when the budget runs out.
pub async fn wait_launcher_ready(path: &Path, budget: u32, interval: Duration) -> Result<()> {
    for attempt in 1..=budget {
        tokio::time::sleep(interval).await;

        let ready = file_exists(path).map_err(|e| Error::LauncherNotReady {
            path: path.to_path_buf(),
            attempts: attempt,
            reason: e.to_string(),
        })?;
        if ready {
            info!(path = %path.display(), attempt, "launcher is ready");
            return Ok(());
        }
        debug!(path = %path.display(), attempt, budget, "launcher not ready yet");
    }

    Err(Error::LauncherNotReady {
        path: path.to_path_buf(),
        attempts: budget,
        reason: "marker did not appear".into(),
    })
}

/// Create the readiness marker at `path`.
///
/// Existing content is left alone, so calling it again is harmless.
pub fn mark_ready(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    info!(path = %path.display(), "marked sidecar ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_wait_launcher_ready_marker_appears() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("healthy");

        let creator = {
            let marker = marker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                fs::File::create(&marker).unwrap();
            })
        };

        let started = Instant::now();
        wait_launcher_ready(&marker, 3, LAUNCHER_POLL_INTERVAL)
            .await
            .unwrap();
        // found on the third check
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
        creator.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_launcher_ready_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("healthy");

        let started = Instant::now();
        let err = wait_launcher_ready(&marker, 1, LAUNCHER_POLL_INTERVAL)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= LAUNCHER_POLL_INTERVAL && elapsed < Duration::from_secs(3));
        match err {
            Error::LauncherNotReady { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_launcher_ready_zero_budget() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("healthy");
        fs::File::create(&marker).unwrap();

        assert!(wait_launcher_ready(&marker, 0, LAUNCHER_POLL_INTERVAL)
            .await
            .is_err());
    }

    #[test]
    fn test_mark_ready() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("infra").join("healthy_sidecar");

        assert!(!file_exists(&marker).unwrap());
        mark_ready(&marker).unwrap();
        assert!(file_exists(&marker).unwrap());

        fs::write(&marker, "keep").unwrap();
        mark_ready(&marker).unwrap();
        assert_eq!(fs::read_to_string(&marker).unwrap(), "keep");
    }

    #[test]
    fn test_file_exists_stat_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "").unwrap();

        // a path below a regular file cannot be stat'ed
        assert!(file_exists(&file.join("child")).is_err());
    }
}
