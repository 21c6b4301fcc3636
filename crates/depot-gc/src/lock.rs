//! Distributed filesystem lock: a `.lock` file recording hostname/pid/timestamp/timeout so a
//! second collector run against the same `checkpoint_dir` can tell whether a lock is still
//! held before aborting, rather than racing the sweep phase.
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockRecord {
    hostname: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    timeout_secs: u64,
}

impl LockRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::seconds(self.timeout_secs as i64)
    }

    fn holder(&self) -> String {
        format!("{}:{}", self.hostname, self.pid)
    }
}

/// Holds the lock for as long as it is alive; `drop` makes a best-effort attempt to remove
/// the lock file so a crashed process doesn't need to wait out its own timeout, but a
/// younger-than-timeout lock left behind by an ungraceful exit still blocks other runs until
/// it ages out -- the same trade-off a plain PID file makes.
pub struct GcLock {
    path: PathBuf,
}

impl GcLock {
    /// Acquire the lock at `dir/.lock`, aborting if an existing lock is younger than its
    /// declared timeout.
    pub async fn acquire(dir: &Path, timeout: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(".lock");

        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(existing) = serde_json::from_slice::<LockRecord>(&bytes) {
                let now = Utc::now();
                if now < existing.expires_at() {
                    return Err(Error::LockContended {
                        holder: existing.holder(),
                        expires_at: existing.expires_at(),
                    });
                }
            }
        }

        let record = LockRecord {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            timeout_secs: timeout.as_secs(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension("lock.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(Self { path })
    }

    pub async fn release(self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for GcLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_contended_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let lock = GcLock::acquire(dir.path(), Duration::from_secs(60)).await.unwrap();
        let err = GcLock::acquire(dir.path(), Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::LockContended { .. }));
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = GcLock::acquire(dir.path(), Duration::from_secs(60)).await.unwrap();
        lock.release().await.unwrap();
        GcLock::acquire(dir.path(), Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = GcLock::acquire(dir.path(), Duration::from_secs(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        GcLock::acquire(dir.path(), Duration::from_secs(60)).await.unwrap();
    }
}
