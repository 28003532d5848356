use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// A holder older than this is presumed dead and its lock is broken.
pub const STALE_LOCK_MS: i64 = 5_000;
/// Total time spent retrying acquisition before giving up.
pub const ACQUIRE_BUDGET_MS: u64 = 4_000;

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at_ms: i64,
}

/// Advisory file lock guarding the state directory's shared files
/// (`clusters.json`, `settings.json`). Released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(dir: &Path, name: &str) -> LedgerResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.lock"));
        let mut waited_ms: u64 = 0;
        let mut attempt: u32 = 0;
        let mut broke_stale = false;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at_ms: Utc::now().timestamp_millis(),
                    };
                    serde_json::to_writer(file, &info)?;
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !broke_stale && lock_is_stale(&path) {
                        // Break a stale holder exactly once per acquisition.
                        broke_stale = true;
                        tracing::warn!(lock = %path.display(), "breaking stale lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if waited_ms >= ACQUIRE_BUDGET_MS {
                        return Err(LedgerError::LockTimeout {
                            path,
                            waited_ms,
                        });
                    }
                    attempt += 1;
                    let backoff = backoff_with_jitter(attempt);
                    waited_ms += backoff;
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        // Unreadable lock file: treat as stale only once it is old enough
        // by mtime, otherwise assume the holder is mid-write.
        return mtime_is_stale(path);
    };
    match serde_json::from_str::<LockInfo>(&raw) {
        Ok(info) => Utc::now().timestamp_millis() - info.acquired_at_ms > STALE_LOCK_MS,
        Err(_) => mtime_is_stale(path),
    }
}

fn mtime_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age.as_millis() as i64 > STALE_LOCK_MS)
        .unwrap_or(false)
}

fn backoff_with_jitter(attempt: u32) -> u64 {
    let base = 50u64.saturating_mul(attempt.min(8) as u64);
    let mut hasher = DefaultHasher::new();
    (std::process::id(), attempt).hash(&mut hasher);
    base + hasher.finish() % 50
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = StateLock::acquire(dir.path(), "clusters").unwrap();
        let path = lock.path().to_path_buf();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let _held = StateLock::acquire(dir.path(), "clusters").unwrap();
        let err = StateLock::acquire(dir.path(), "clusters").unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));
    }

    #[test]
    fn stale_lock_is_broken_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.lock");
        let stale = LockInfo {
            pid: 0,
            acquired_at_ms: Utc::now().timestamp_millis() - STALE_LOCK_MS - 1_000,
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = StateLock::acquire(dir.path(), "clusters").unwrap();
        let raw = std::fs::read_to_string(lock.path()).unwrap();
        let info: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn fresh_foreign_lock_is_not_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clusters.lock");
        let fresh = LockInfo {
            pid: 0,
            acquired_at_ms: Utc::now().timestamp_millis(),
        };
        std::fs::write(&path, serde_json::to_string(&fresh).unwrap()).unwrap();

        let err = StateLock::acquire(dir.path(), "clusters").unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));
        let raw = std::fs::read_to_string(&path).unwrap();
        let info: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.pid, 0);
    }
}
