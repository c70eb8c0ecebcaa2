//! File-based mutual exclusion for orchestration runs.
//!
//! One JSON lock record per resource under `.conductor/locks/`. Acquisition
//! uses create-if-absent semantics so two processes racing for the same
//! resource cannot both win; staleness (TTL elapsed or holder process dead)
//! lets any process reclaim a lock abandoned by a crash. Ownership is by
//! record, not call count: a second acquire from the holder's own PID sees
//! a live lock and contends like anyone else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::LockError;

/// Attempts before an acquire reports contention.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Delay between attempts on a live lock.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// On-disk lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub pid: u32,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl LockRecord {
    /// Stale when the TTL has elapsed or the holder process is gone.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.created_at).num_seconds();
        if elapsed >= self.ttl_seconds as i64 {
            return true;
        }
        !process_alive(self.pid)
    }
}

/// Outcome of an acquire call. Contention is an expected result, not an
/// error; callers branch on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Contended { holder_pid: u32, owner: String },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired)
    }
}

/// One lock record plus its current staleness, for display.
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub record: LockRecord,
    pub stale: bool,
}

/// Manages lock records under one directory.
pub struct LockManager {
    locks_dir: PathBuf,
    max_attempts: u32,
    retry_delay: Duration,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the retry bounds (tests and fast-failing callers).
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", resource))
    }

    /// Acquire `resource`, retrying on contention up to the configured bound.
    ///
    /// A stale record is deleted and the slot retried immediately. Losing a
    /// creation race never falls back to overwriting the winner's record.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl_seconds: u64,
        owner: &str,
    ) -> Result<AcquireOutcome, LockError> {
        let path = self.lock_path(resource);
        std::fs::create_dir_all(&self.locks_dir).map_err(|source| LockError::WriteFailed {
            path: self.locks_dir.clone(),
            source,
        })?;

        let mut last_holder: Option<(u32, String)> = None;
        for attempt in 1..=self.max_attempts {
            match self.read_record(&path)? {
                None => {
                    if self.try_create(&path, resource, ttl_seconds, owner)? {
                        debug!(resource, owner, "lock acquired");
                        return Ok(AcquireOutcome::Acquired);
                    }
                    // Lost the creation race; the winner's record shows up
                    // on the next read.
                    debug!(resource, attempt, "lost lock creation race");
                }
                Some(record) if record.is_stale(Utc::now()) => {
                    warn!(
                        resource,
                        holder_pid = record.pid,
                        "reclaiming stale lock"
                    );
                    self.remove(&path)?;
                    continue; // no delay after reclaiming
                }
                Some(record) => {
                    debug!(
                        resource,
                        holder_pid = record.pid,
                        attempt,
                        "lock held, waiting"
                    );
                    last_holder = Some((record.pid, record.owner));
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        let (holder_pid, owner) = match self.read_record(&path)? {
            Some(record) => (record.pid, record.owner),
            None => last_holder.unwrap_or((0, "unknown".to_string())),
        };
        Ok(AcquireOutcome::Contended { holder_pid, owner })
    }

    /// Release `resource` if and only if this process holds it.
    pub fn release(&self, resource: &str) -> Result<(), LockError> {
        let path = self.lock_path(resource);
        let record = self
            .read_record(&path)?
            .ok_or_else(|| LockError::NotHeld {
                resource: resource.to_string(),
            })?;

        if record.pid != std::process::id() {
            return Err(LockError::NotOwner {
                resource: resource.to_string(),
                holder_pid: record.pid,
            });
        }

        self.remove(&path)?;
        debug!(resource, "lock released");
        Ok(())
    }

    /// Sweep every lock record and remove the stale ones, regardless of
    /// ownership. Run at startup; heals locks left by crashed processes.
    /// Returns the number of records removed.
    pub fn cleanup_stale_locks(&self) -> Result<usize, LockError> {
        let mut removed = 0;
        for path in self.lock_files()? {
            match self.read_record(&path) {
                Ok(Some(record)) => {
                    if record.is_stale(Utc::now()) {
                        warn!(
                            resource = %record.resource,
                            holder_pid = record.pid,
                            "removing stale lock"
                        );
                        self.remove(&path)?;
                        removed += 1;
                    }
                }
                Ok(None) => {}
                Err(LockError::Corrupt { .. }) => {
                    warn!(path = %path.display(), "removing unreadable lock record");
                    self.remove(&path)?;
                    removed += 1;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(removed)
    }

    /// Every lock record on disk, with its staleness.
    pub fn list(&self) -> Result<Vec<LockStatus>, LockError> {
        let now = Utc::now();
        let mut statuses = Vec::new();
        for path in self.lock_files()? {
            if let Some(record) = self.read_record(&path)? {
                let stale = record.is_stale(now);
                statuses.push(LockStatus { record, stale });
            }
        }
        statuses.sort_by(|a, b| a.record.resource.cmp(&b.record.resource));
        Ok(statuses)
    }

    fn lock_files(&self) -> Result<Vec<PathBuf>, LockError> {
        let pattern = self.locks_dir.join("*.lock");
        let paths = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| LockError::ReadFailed {
                path: self.locks_dir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?
            .filter_map(|entry| entry.ok())
            .collect();
        Ok(paths)
    }

    /// Corruption is surfaced as `LockError::Corrupt` so sweepers can treat
    /// it as reclaimable; a missing file is `None`.
    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>, LockError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LockError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let record =
            serde_json::from_str(&content).map_err(|source| LockError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Some(record))
    }

    /// Returns false when another creator won the race.
    fn try_create(
        &self,
        path: &Path,
        resource: &str,
        ttl_seconds: u64,
        owner: &str,
    ) -> Result<bool, LockError> {
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(source) => {
                return Err(LockError::WriteFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let record = LockRecord {
            resource: resource.to_string(),
            pid: std::process::id(),
            owner: owner.to_string(),
            created_at: Utc::now(),
            ttl_seconds,
        };
        // Pretty JSON so a human can inspect a wedged lock directly.
        let json = serde_json::to_string_pretty(&record).map_err(|e| LockError::WriteFailed {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        if let Err(source) = file.write_all(json.as_bytes()) {
            // Don't leave a half-written record claiming the resource.
            let _ = std::fs::remove_file(path);
            return Err(LockError::WriteFailed {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(true)
    }

    fn remove(&self, path: &Path) -> Result<(), LockError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::WriteFailed {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Zero-signal liveness probe. EPERM still means the process exists.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_manager(dir: &Path) -> LockManager {
        LockManager::new(dir).with_retry(2, Duration::from_millis(1))
    }

    fn write_record(dir: &Path, record: &LockRecord) {
        let path = dir.join(format!("{}.lock", record.resource));
        std::fs::write(path, serde_json::to_string_pretty(record).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_acquire_creates_record_with_own_pid() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());

        let outcome = manager.acquire("orchestration", 300, "run-1").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired);

        let content =
            std::fs::read_to_string(dir.path().join("orchestration.lock")).unwrap();
        let record: LockRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.owner, "run-1");
        assert_eq!(record.resource, "orchestration");
        assert_eq!(record.ttl_seconds, 300);
    }

    #[tokio::test]
    async fn test_second_acquire_from_same_pid_contends() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());

        assert!(manager.acquire("r", 300, "a").await.unwrap().is_acquired());
        // Ownership is by record, not call count; our own live lock blocks us.
        let second = manager.acquire("r", 300, "b").await.unwrap();
        assert_eq!(
            second,
            AcquireOutcome::Contended {
                holder_pid: std::process::id(),
                owner: "a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_acquire_reclaims_expired_ttl() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        write_record(
            dir.path(),
            &LockRecord {
                resource: "r".into(),
                pid: std::process::id(),
                owner: "old".into(),
                created_at: Utc::now() - chrono::Duration::hours(2),
                ttl_seconds: 3600,
            },
        );

        assert!(manager.acquire("r", 300, "new").await.unwrap().is_acquired());
        let content = std::fs::read_to_string(dir.path().join("r.lock")).unwrap();
        assert!(content.contains("\"new\""));
    }

    #[tokio::test]
    async fn test_acquire_reclaims_dead_holder_regardless_of_ttl() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        write_record(
            dir.path(),
            &LockRecord {
                resource: "r".into(),
                pid: 0x7fff_fff0, // beyond any real pid on test hosts
                owner: "crashed".into(),
                created_at: Utc::now(),
                ttl_seconds: 86_400,
            },
        );

        assert!(manager.acquire("r", 300, "new").await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_release_own_lock_removes_record() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        manager.acquire("r", 300, "a").await.unwrap();

        manager.release("r").unwrap();
        assert!(!dir.path().join("r.lock").exists());
    }

    #[test]
    fn test_release_without_lock_reports_not_held() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        let err = manager.release("r").unwrap_err();
        assert!(matches!(err, LockError::NotHeld { .. }));
    }

    #[test]
    fn test_release_foreign_lock_is_refused() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        write_record(
            dir.path(),
            &LockRecord {
                resource: "r".into(),
                pid: 1, // alive and never ours
                owner: "init".into(),
                created_at: Utc::now(),
                ttl_seconds: 86_400,
            },
        );

        let err = manager.release("r").unwrap_err();
        assert!(matches!(err, LockError::NotOwner { holder_pid: 1, .. }));
        assert!(dir.path().join("r.lock").exists());
    }

    #[test]
    fn test_cleanup_removes_stale_and_corrupt_keeps_live() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        write_record(
            dir.path(),
            &LockRecord {
                resource: "live".into(),
                pid: std::process::id(),
                owner: "me".into(),
                created_at: Utc::now(),
                ttl_seconds: 3600,
            },
        );
        write_record(
            dir.path(),
            &LockRecord {
                resource: "expired".into(),
                pid: std::process::id(),
                owner: "me".into(),
                created_at: Utc::now() - chrono::Duration::hours(3),
                ttl_seconds: 60,
            },
        );
        std::fs::write(dir.path().join("garbage.lock"), "not json").unwrap();

        let removed = manager.cleanup_stale_locks().unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("live.lock").exists());
        assert!(!dir.path().join("expired.lock").exists());
        assert!(!dir.path().join("garbage.lock").exists());
    }

    #[test]
    fn test_list_reports_staleness() {
        let dir = tempdir().unwrap();
        let manager = fast_manager(dir.path());
        write_record(
            dir.path(),
            &LockRecord {
                resource: "fresh".into(),
                pid: std::process::id(),
                owner: "me".into(),
                created_at: Utc::now(),
                ttl_seconds: 3600,
            },
        );
        write_record(
            dir.path(),
            &LockRecord {
                resource: "old".into(),
                pid: std::process::id(),
                owner: "me".into(),
                created_at: Utc::now() - chrono::Duration::hours(2),
                ttl_seconds: 60,
            },
        );

        let statuses = manager.list().unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(!statuses[0].stale); // "fresh" sorts first
        assert!(statuses[1].stale);
    }

    #[test]
    fn test_record_staleness_rules() {
        let record = LockRecord {
            resource: "r".into(),
            pid: std::process::id(),
            owner: "me".into(),
            created_at: Utc::now(),
            ttl_seconds: 60,
        };
        assert!(!record.is_stale(Utc::now()));
        assert!(record.is_stale(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
