//! Advisory lock file serializing writers to the persistent push queue.
//!
//! The lock is a JSON sentinel file (`<queue_dir>/queue.lock`) containing
//! the holder's pid, hostname, and acquisition time. It is exclusive only
//! — there is no distinct shared mode — so readers acquire it the same
//! way writers do, for the short duration of the read. This mirrors a
//! single-writer/single-reader-at-a-time discipline rather than a true
//! POSIX `flock(LOCK_SH)`, which is sufficient because queue reads and
//! writes are both brief, whole-file operations.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "queue.lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Which role holds the lock (`"hook"`, `"daemon"`, ...), for diagnostics.
    pub holder: Option<String>,
}

/// Lock handle that releases the sentinel file on drop.
#[derive(Debug)]
pub struct QueueLock {
    path: PathBuf,
}

impl QueueLock {
    /// Acquire the lock in `queue_dir`. Fails immediately if already held.
    pub fn acquire(queue_dir: &Path) -> Result<Self> {
        let lock_path = queue_dir.join(LOCK_FILE);

        fs::create_dir_all(queue_dir)
            .with_context(|| format!("failed to create queue dir {}", queue_dir.display()))?;

        if lock_path.exists() {
            let info = read_lock_info_from_path(&lock_path)?;
            bail!(
                "queue lock already held by pid {} on {} since {} (holder: {:?})",
                info.pid,
                info.hostname,
                info.acquired_at,
                info.holder
            );
        }

        write_lock_info(
            &lock_path,
            &LockInfo {
                pid: std::process::id(),
                hostname: gethostname::gethostname().to_string_lossy().to_string(),
                acquired_at: Utc::now(),
                holder: None,
            },
        )?;

        Ok(Self { path: lock_path })
    }

    /// Acquire the lock, clearing out a stale one (older than `timeout`)
    /// first if present.
    pub fn acquire_with_timeout(queue_dir: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = queue_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match read_lock_info_from_path(&lock_path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        tracing::warn!(
                            pid = info.pid,
                            hostname = %info.hostname,
                            "removing stale queue lock"
                        );
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "queue lock already held by pid {} on {} (age: {:?})",
                            info.pid,
                            info.hostname,
                            age
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock {}", lock_path.display())
                    })?;
                }
            }
        }

        Self::acquire(queue_dir)
    }

    pub fn set_holder(&self, holder: &str) -> Result<()> {
        let mut info = read_lock_info_from_path(&self.path)?;
        info.holder = Some(holder.to_string());
        write_lock_info(&self.path, &info)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn is_locked(queue_dir: &Path) -> bool {
        queue_dir.join(LOCK_FILE).exists()
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename lock into place at {}", path.display()))?;
    Ok(())
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_and_release_removes_sentinel() {
        let td = tempdir().unwrap();
        let mut lock = QueueLock::acquire(td.path()).unwrap();
        assert!(QueueLock::is_locked(td.path()));
        lock.release().unwrap();
        assert!(!QueueLock::is_locked(td.path()));
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let td = tempdir().unwrap();
        let _lock1 = QueueLock::acquire(td.path()).unwrap();
        let result = QueueLock::acquire(td.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already held"));
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().unwrap();
        {
            let _lock = QueueLock::acquire(td.path()).unwrap();
            assert!(QueueLock::is_locked(td.path()));
        }
        assert!(!QueueLock::is_locked(td.path()));
    }

    #[test]
    fn set_holder_updates_info() {
        let td = tempdir().unwrap();
        let lock = QueueLock::acquire(td.path()).unwrap();
        lock.set_holder("daemon").unwrap();
        let info = read_lock_info_from_path(&td.path().join(LOCK_FILE)).unwrap();
        assert_eq!(info.holder.as_deref(), Some("daemon"));
    }

    #[test]
    fn stale_lock_is_reclaimed_after_timeout() {
        let td = tempdir().unwrap();
        let lock_path = td.path().join(LOCK_FILE);
        let stale = LockInfo {
            pid: 99999,
            hostname: "other-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            holder: None,
        };
        fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let _lock = QueueLock::acquire_with_timeout(td.path(), Duration::from_secs(3600)).unwrap();
        let info = read_lock_info_from_path(&lock_path).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn fresh_lock_is_not_reclaimed() {
        let td = tempdir().unwrap();
        let _lock1 = QueueLock::acquire(td.path()).unwrap();
        let result = QueueLock::acquire_with_timeout(td.path(), Duration::from_secs(3600));
        assert!(result.is_err());
    }
}
