//! Lock files shared by every process working on one state directory.
//!
//! [`LockGuard`] is a short-lived write lock: a store holds it for one
//! read-modify-write of its file. [`RunnerLock`] marks the process that runs
//! the scheduler. It is held for the lifetime of `run` and kept fresh by a
//! heartbeat, so other processes can tell a live runner from one that died.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MeshError;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

const RUNNER_HEARTBEAT: Duration = Duration::from_secs(2);
const RUNNER_STALE_AFTER: Duration = Duration::from_secs(10);

fn create_parent(path: &Path) -> Result<(), MeshError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Creates `path` exclusively and writes our pid into it.
fn create_exclusive(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

fn is_stale(path: &Path, after: Duration) -> Result<bool, MeshError> {
    match std::fs::metadata(path) {
        Ok(metadata) => {
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            Ok(age > after)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(MeshError::Io(err)),
    }
}

/// Exclusive write lock, released on drop.
#[derive(Debug)]
pub(crate) struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub(crate) fn acquire(path: &Path) -> Result<Self, MeshError> {
        create_parent(path)?;
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match create_exclusive(path) {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path, LOCK_STALE_AFTER)? {
                        warn!(path = %path.display(), "Removing stale lock file");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(MeshError::LockTimeout(path.to_path_buf()));
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(MeshError::Io(err)),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Claim on the scheduler role for one state directory.
///
/// Inside a tokio runtime a background task rewrites the file every few
/// seconds. A claim whose file was not refreshed for a while belongs to a
/// dead process and may be taken over.
#[derive(Debug)]
pub struct RunnerLock {
    path: PathBuf,
    heartbeat: CancellationToken,
}

impl RunnerLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self, MeshError> {
        create_parent(path)?;
        loop {
            match create_exclusive(path) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if !is_stale(path, RUNNER_STALE_AFTER)? {
                        return Err(MeshError::RunnerActive(path.to_path_buf()));
                    }
                    warn!(path = %path.display(), "Taking over runner lock of a dead process");
                    let _ = std::fs::remove_file(path);
                }
                Err(err) => return Err(MeshError::Io(err)),
            }
        }

        let heartbeat = CancellationToken::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(beat(path.to_path_buf(), heartbeat.clone()));
        }
        debug!(path = %path.display(), "Runner lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            heartbeat,
        })
    }

    /// Whether a live runner currently holds `path`.
    pub fn is_held(path: &Path) -> bool {
        path.exists() && !is_stale(path, RUNNER_STALE_AFTER).unwrap_or(false)
    }
}

async fn beat(path: PathBuf, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(RUNNER_HEARTBEAT) => {}
        }
        // Never recreates the file once the lock has been released.
        let touched = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await;
        match touched {
            Ok(mut file) => {
                let _ = file
                    .write_all(format!("{}\n", std::process::id()).as_bytes())
                    .await;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Runner heartbeat failed");
                break;
            }
        }
    }
}

impl Drop for RunnerLock {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert!(path.exists());
        assert!(create_exclusive(&path).is_err());
        drop(guard);

        assert!(!path.exists());
        let _again = LockGuard::acquire(&path).unwrap();
    }

    #[test]
    fn runner_lock_refuses_second_runner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.runner.lock");
        assert!(!RunnerLock::is_held(&path));

        let runner = RunnerLock::acquire(&path).unwrap();
        assert!(RunnerLock::is_held(&path));
        assert!(matches!(
            RunnerLock::acquire(&path),
            Err(MeshError::RunnerActive(_))
        ));

        drop(runner);
        assert!(!RunnerLock::is_held(&path));
        let _next = RunnerLock::acquire(&path).unwrap();
    }

    #[tokio::test]
    async fn heartbeat_stops_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.runner.lock");
        drop(RunnerLock::acquire(&path).unwrap());
        tokio::task::yield_now().await;
        assert!(!path.exists());
    }
}
