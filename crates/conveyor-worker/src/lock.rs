//! Advisory singleton lock. One worker per configured path per host; a
//! development convenience, not a cluster-wide safety guarantee.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use conveyor_core::QueueError;

pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// Create the lock file if needed and take an exclusive advisory lock.
    /// Failure means another worker already holds the path.
    pub fn acquire(path: &Path) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                QueueError::Internal(format!(
                    "cannot open lock file {}: {e}",
                    path.display()
                ))
            })?;

        file.try_lock_exclusive().map_err(|e| {
            QueueError::Internal(format!(
                "another worker holds the singleton lock {}: {e}",
                path.display()
            ))
        })?;

        tracing::debug!(path = %path.display(), "singleton lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release singleton lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");

        let held = SingletonLock::acquire(&path).unwrap();
        assert!(SingletonLock::acquire(&path).is_err());

        drop(held);
        assert!(SingletonLock::acquire(&path).is_ok());
    }
}
