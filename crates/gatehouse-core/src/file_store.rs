//! Durable JSON file store shared by cooperating processes.
//!
//! Each read-modify-write cycle holds `<path>.lock`, a file created with
//! `create_new` that records the owning pid and creation time. Locks older
//! than [`LockOptions::stale_after`] belong to a crashed process and are
//! reclaimed. Writes go to a temp file in the same directory and are renamed
//! into place, so readers never observe a partial document.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::error::{GatehouseError, Result};

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub stale_after: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl LockOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            stale_after: Duration::from_millis(config.lock_stale_ms),
            timeout: Duration::from_millis(config.lock_timeout_ms),
            poll_interval: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockInfo {
    pid: u32,
    created_at_ms: u64,
}

/// A held store lock. Dropping it removes the lock file if it is still ours.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    info: LockInfo,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let still_ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok())
            .is_some_and(|info| info == self.info);
        if still_ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
        }
    }
}

enum LockAttempt {
    Acquired(FileLockGuard),
    Held,
}

pub struct JsonFileStore {
    path: PathBuf,
    lock: LockOptions,
    clock: SharedClock,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockOptions, clock: SharedClock) -> Self {
        Self {
            path: path.into(),
            lock,
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Read the current document, or `T::default()` if the file does not exist.
    pub async fn read<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(T::default()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                GatehouseError::Store(format!("{} is corrupt: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Locked read-modify-write. Nothing is written when `f` fails.
    pub async fn update<T, R, F>(&self, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let _guard = self.acquire_lock().await?;
        let mut data: T = self.read().await?;
        let out = f(&mut data)?;
        self.write_atomic(&data).await?;
        Ok(out)
    }

    /// Acquire the store lock, polling until the configured deadline.
    pub async fn acquire_lock(&self) -> Result<FileLockGuard> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let deadline = tokio::time::Instant::now() + self.lock.timeout;

        loop {
            match self.try_lock(&lock_path)? {
                LockAttempt::Acquired(guard) => return Ok(guard),
                LockAttempt::Held => {
                    if self.reclaim_if_stale(&lock_path) {
                        continue;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(path = %lock_path.display(), "Timed out waiting for store lock");
                return Err(GatehouseError::LockTimeout(lock_path));
            }
            tokio::time::sleep(self.lock.poll_interval).await;
        }
    }

    // Synchronous on purpose: no await point between creating the lock file
    // and owning its guard.
    fn try_lock(&self, lock_path: &Path) -> Result<LockAttempt> {
        let info = LockInfo {
            pid: std::process::id(),
            created_at_ms: self.clock.now_ms(),
        };
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(LockAttempt::Held);
            }
            Err(e) => return Err(e.into()),
        };
        let guard = FileLockGuard {
            path: lock_path.to_path_buf(),
            info: info.clone(),
        };
        file.write_all(serde_json::to_string(&info)?.as_bytes())?;
        Ok(LockAttempt::Acquired(guard))
    }

    /// Remove the lock if its holder is presumed dead. Returns true when removed.
    fn reclaim_if_stale(&self, lock_path: &Path) -> bool {
        let raw = std::fs::read_to_string(lock_path).ok();
        let created_at_ms = raw
            .as_deref()
            .and_then(|r| serde_json::from_str::<LockInfo>(r).ok())
            .map(|info| info.created_at_ms)
            .or_else(|| modified_ms(lock_path));
        let Some(created_at_ms) = created_at_ms else {
            return false;
        };

        let age_ms = self.clock.now_ms().saturating_sub(created_at_ms);
        if u128::from(age_ms) <= self.lock.stale_after.as_millis() {
            return false;
        }

        // Only remove what we judged stale; another process may have reclaimed it already.
        if std::fs::read_to_string(lock_path).ok() != raw {
            return false;
        }
        match std::fs::remove_file(lock_path) {
            Ok(()) => {
                warn!(path = %lock_path.display(), age_ms, "Reclaimed stale store lock");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(_) => false,
        }
    }

    async fn write_atomic<T: Serialize>(&self, data: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(data)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".into());
        let tmp = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let result = async {
            let mut file = options.open(&tmp).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = json.len(), "Store written");
        Ok(())
    }
}

fn modified_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_millis()).ok()
}
