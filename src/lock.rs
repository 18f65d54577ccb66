//! Run-level session lock
//!
//! The remote service allows one active session per account, so two runs for
//! the same account must not overlap. Each run holds an exclusive advisory lock
//! on `<lock_dir>/<account>.lock` for its whole duration; a second run fails
//! fast instead of waiting.

use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another run holds the lock
    #[error("another run for account '{account}' is in progress (lock: {path})")]
    AlreadyHeld {
        /// Account name
        account: String,
        /// Lock file path
        path: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Exclusive lock held for the lifetime of a run
///
/// Released when dropped (closing the file releases the OS lock).
pub struct RunLock {
    path: PathBuf,
    #[allow(dead_code)]
    lock: RwLock<File>,
}

impl RunLock {
    /// Try to acquire the lock for `account` without blocking
    pub fn try_acquire(lock_dir: &Path, account: &str) -> Result<Self, LockError> {
        std::fs::create_dir_all(lock_dir).map_err(|e| LockError::IoError(e.to_string()))?;

        let path = lock_dir.join(format!("{}.lock", lock_file_stem(account)));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LockError::IoError(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        match lock.try_write() {
            // The OS lock lives as long as the file handle; keep it past the guard
            Ok(guard) => std::mem::forget(guard),
            Err(_) => {
                return Err(LockError::AlreadyHeld {
                    account: account.to_string(),
                    path: path.display().to_string(),
                })
            }
        }

        debug!(path = %path.display(), "Run lock acquired");
        Ok(Self { path, lock })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

/// File-name-safe form of an account name
fn lock_file_stem(account: &str) -> String {
    let stem: String = account
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        "default".to_string()
    } else {
        stem
    }
}
