//! The persistent push queue (C2): a durable multiset of push jobs keyed
//! by lineage name, serialized to a single file inside `queue_dir` and
//! protected by [`certdeploy_lock::QueueLock`].

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use certdeploy_lock::QueueLock;
use certdeploy_types::{AttemptState, CertDeployError, PushJob, QueueEntry};
use serde::{Deserialize, Serialize};

pub const QUEUE_FILE: &str = "queue";
const CURRENT_QUEUE_VERSION: &str = "certdeploy.queue.v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueFile {
    queue_version: String,
    #[serde(default)]
    entries: BTreeMap<String, QueueEntry>,
}

impl Default for QueueFile {
    fn default() -> Self {
        Self {
            queue_version: CURRENT_QUEUE_VERSION.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

/// Handle onto the on-disk queue in `queue_dir`. Cheap to clone: every
/// clone reacquires the lockfile independently for each operation.
#[derive(Clone)]
pub struct Queue {
    queue_dir: PathBuf,
}

impl Queue {
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
        }
    }

    fn path(&self) -> PathBuf {
        self.queue_dir.join(QUEUE_FILE)
    }

    fn read(&self) -> Result<QueueFile, CertDeployError> {
        let path = self.path();
        if !path.exists() {
            return Ok(QueueFile::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| CertDeployError::queue_corrupt(format!("cannot read queue: {e}")))?;
        if content.trim().is_empty() {
            return Ok(QueueFile::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| CertDeployError::queue_corrupt(format!("cannot parse queue: {e}")))
    }

    fn write(&self, file: &QueueFile) -> Result<()> {
        fs::create_dir_all(&self.queue_dir)
            .with_context(|| format!("failed to create queue dir {}", self.queue_dir.display()))?;
        let path = self.path();
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(file).context("failed to serialize queue")?;
        {
            let f = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            use std::io::Write;
            let mut f = f;
            f.write_all(&data)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            f.sync_all().ok();
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        if let Some(parent) = path.parent()
            && let Ok(dir) = fs::File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Enqueue a job. A job with the same `lineage_name` already present
    /// is superseded: its domains are replaced and its per-client attempt
    /// state is reset (a re-issued lineage must be re-offered to everyone).
    pub fn enqueue(&self, job: PushJob) -> Result<()> {
        let _lock = QueueLock::acquire_with_timeout(&self.queue_dir, DEFAULT_LOCK_TIMEOUT)?;
        let mut file = self.read()?;
        file.entries
            .insert(job.lineage_name.clone(), QueueEntry::new(job));
        self.write(&file)
    }

    /// Full snapshot of pending entries, for draining.
    pub fn snapshot(&self) -> Result<Vec<QueueEntry>> {
        let _lock = QueueLock::acquire_with_timeout(&self.queue_dir, DEFAULT_LOCK_TIMEOUT)?;
        let file = self.read()?;
        Ok(file.entries.into_values().collect())
    }

    /// Record that `client` has reached `state` for `lineage_name`.
    pub fn set_attempt_state(
        &self,
        lineage_name: &str,
        client: &str,
        state: AttemptState,
    ) -> Result<()> {
        let _lock = QueueLock::acquire_with_timeout(&self.queue_dir, DEFAULT_LOCK_TIMEOUT)?;
        let mut file = self.read()?;
        if let Some(entry) = file.entries.get_mut(lineage_name) {
            entry.per_client.insert(client.to_string(), state);
        }
        self.write(&file)
    }

    /// Remove an entry once every targeted client has succeeded or
    /// exhausted its retry budget.
    pub fn remove(&self, lineage_name: &str) -> Result<()> {
        let _lock = QueueLock::acquire_with_timeout(&self.queue_dir, DEFAULT_LOCK_TIMEOUT)?;
        let mut file = self.read()?;
        file.entries.remove(lineage_name);
        self.write(&file)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let _lock = QueueLock::acquire_with_timeout(&self.queue_dir, DEFAULT_LOCK_TIMEOUT)?;
        Ok(self.read()?.entries.is_empty())
    }
}

const DEFAULT_LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn job(name: &str) -> PushJob {
        PushJob::new(PathBuf::from(format!("/etc/letsencrypt/live/{name}")), vec![
            name.to_string(),
        ])
    }

    #[test]
    fn enqueue_then_snapshot_round_trips() {
        let td = tempdir().unwrap();
        let q = Queue::new(td.path());
        q.enqueue(job("example.com")).unwrap();
        let snap = q.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].job.lineage_name, "example.com");
    }

    #[test]
    fn duplicate_lineage_is_deduplicated() {
        let td = tempdir().unwrap();
        let q = Queue::new(td.path());
        q.enqueue(job("example.com")).unwrap();
        q.enqueue(PushJob::new(
            PathBuf::from("/etc/letsencrypt/live/example.com"),
            vec!["example.com".to_string(), "www.example.com".to_string()],
        ))
        .unwrap();
        let snap = q.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].job.domains.len(), 2);
    }

    #[test]
    fn remove_drops_the_entry() {
        let td = tempdir().unwrap();
        let q = Queue::new(td.path());
        q.enqueue(job("example.com")).unwrap();
        q.remove("example.com").unwrap();
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn empty_queue_drain_is_a_no_op() {
        let td = tempdir().unwrap();
        let q = Queue::new(td.path());
        assert!(q.is_empty().unwrap());
        assert!(q.snapshot().unwrap().is_empty());
    }

    #[test]
    fn corrupt_queue_file_is_fatal() {
        let td = tempdir().unwrap();
        fs::create_dir_all(td.path()).unwrap();
        fs::write(td.path().join(QUEUE_FILE), b"{not json").unwrap();
        let q = Queue::new(td.path());
        let err = q.snapshot().unwrap_err();
        assert!(err.to_string().contains("QueueCorrupt"));
    }

    #[test]
    fn attempt_state_is_tracked_per_client() {
        let td = tempdir().unwrap();
        let q = Queue::new(td.path());
        q.enqueue(job("example.com")).unwrap();
        q.set_attempt_state("example.com", "clientA", AttemptState::Succeeded)
            .unwrap();
        let snap = q.snapshot().unwrap();
        assert_eq!(
            snap[0].per_client.get("clientA"),
            Some(&AttemptState::Succeeded)
        );
    }

    #[test]
    fn queue_survives_process_restart_simulation() {
        let td = tempdir().unwrap();
        {
            let q = Queue::new(td.path());
            q.enqueue(job("example.com")).unwrap();
        }
        let q2 = Queue::new(td.path());
        assert_eq!(q2.snapshot().unwrap().len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn enqueue_is_idempotent_for_identical_jobs(name in "[a-z][a-z0-9.-]{2,20}") {
            let td = tempdir().unwrap();
            let q = Queue::new(td.path());
            let j = PushJob::new(PathBuf::from(format!("/x/{name}")), vec![name.clone()]);
            q.enqueue(j.clone()).unwrap();
            q.enqueue(j).unwrap();
            let snap = q.snapshot().unwrap();
            proptest::prop_assert_eq!(snap.len(), 1);
        }
    }
}
