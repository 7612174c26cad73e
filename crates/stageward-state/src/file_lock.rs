//! File-backed state lock
//!
//! One lock file per environment under a shared directory (e.g. a mounted
//! volume on a CI runner). Acquisition relies on exclusive `create_new`, so
//! two processes on the same filesystem can never both hold the lock.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{LockGuard, StateLock, StorageResult};

/// State lock using `<dir>/<environment>.lock` files.
#[derive(Debug, Clone)]
pub struct FileStateLock {
    dir: PathBuf,
}

impl FileStateLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, environment: &str) -> PathBuf {
        self.dir.join(format!("{environment}.lock"))
    }

    async fn read_guard(path: &Path) -> Option<LockGuard> {
        let raw = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

#[async_trait]
impl StateLock for FileStateLock {
    async fn acquire(&self, environment: &str, owner: &str) -> StorageResult<LockGuard> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.lock_path(environment);

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::read_guard(&path).await.map(|g| g.owner);
                return Err(StorageError::LockUnavailable {
                    environment: environment.to_string(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let guard = LockGuard::new(environment, owner);
        let payload = serde_json::to_vec_pretty(&guard)?;
        if let Err(e) = file.write_all(&payload).await {
            // Do not leave a half-written lock behind.
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }
        file.flush().await?;

        debug!(environment, owner, path = %path.display(), "state lock acquired");
        Ok(guard)
    }

    async fn release(&self, guard: LockGuard) -> StorageResult<()> {
        let path = self.lock_path(&guard.environment);
        match Self::read_guard(&path).await {
            Some(current) if current.token == guard.token => {
                tokio::fs::remove_file(&path).await?;
                debug!(environment = %guard.environment, "state lock released");
                Ok(())
            }
            Some(_) | None => {
                warn!(
                    environment = %guard.environment,
                    "lock file missing or owned by another run"
                );
                Err(StorageError::LockNotHeld {
                    environment: guard.environment,
                    token: guard.token,
                })
            }
        }
    }
}

/// Lock that always succeeds.
///
/// Used when the engine's own state backend provides locking and the
/// controller should not add a second layer.
#[derive(Debug, Clone, Default)]
pub struct NoopStateLock;

#[async_trait]
impl StateLock for NoopStateLock {
    async fn acquire(&self, environment: &str, owner: &str) -> StorageResult<LockGuard> {
        Ok(LockGuard::new(environment, owner))
    }

    async fn release(&self, _guard: LockGuard) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_reports_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileStateLock::new(dir.path());

        let guard = lock.acquire("prod", "run-a").await.unwrap();
        let err = lock.acquire("prod", "run-b").await.unwrap_err();
        match err {
            StorageError::LockUnavailable { environment, holder } => {
                assert_eq!(environment, "prod");
                assert_eq!(holder.as_deref(), Some("run-a"));
            }
            other => panic!("unexpected error: {other}"),
        }

        lock.release(guard).await.unwrap();
        let again = lock.acquire("prod", "run-b").await.unwrap();
        assert_eq!(again.owner, "run-b");
    }

    #[tokio::test]
    async fn environments_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileStateLock::new(dir.path());

        let _dev = lock.acquire("dev", "run-a").await.unwrap();
        let _prod = lock.acquire("prod", "run-a").await.unwrap();
        assert!(dir.path().join("dev.lock").exists());
        assert!(dir.path().join("prod.lock").exists());
    }

    #[tokio::test]
    async fn release_with_stale_guard_fails() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileStateLock::new(dir.path());

        let guard = lock.acquire("staging", "run-a").await.unwrap();
        let mut stale = guard.clone();
        stale.token = "not-the-token".to_string();

        assert!(matches!(
            lock.release(stale).await,
            Err(StorageError::LockNotHeld { .. })
        ));
        lock.release(guard).await.unwrap();
        assert!(!dir.path().join("staging.lock").exists());
    }

    #[tokio::test]
    async fn noop_lock_never_blocks() {
        let lock = NoopStateLock;
        let a = lock.acquire("prod", "a").await.unwrap();
        let b = lock.acquire("prod", "b").await.unwrap();
        lock.release(a).await.unwrap();
        lock.release(b).await.unwrap();
    }
}
