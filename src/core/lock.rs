/// Per-installation advisory lock
///
/// Two simultaneous pipeline runs against one installation (snapshot vs
/// snapshot, or snapshot racing a restore) would corrupt the staging tree
/// and interleave compose operations. Both pipelines take this lock before
/// doing anything and fail fast when it is already held.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::constants::LOCK_FILE;

#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(LOCK_FILE);

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                let holder_pid: Option<u32> = holder.trim().parse().ok();

                // A lock whose holder is gone is stale; reclaim it once.
                if let Some(pid) = holder_pid {
                    if !Path::new("/proc").join(pid.to_string()).exists() {
                        tracing::warn!("reclaiming stale lock left by pid {}", pid);
                        fs::remove_file(&path).ok();
                        return Self::try_create(&path).map_err(|e| {
                            anyhow::anyhow!("failed to reacquire lock {}: {}", path.display(), e)
                        });
                    }
                }

                bail!(
                    "another snapshot or restore is already running (lock {} held by pid {}); \
                     wait for it to finish or remove the file if it is stale",
                    path.display(),
                    holder.trim()
                )
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to create lock {}", path.display()))
            }
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();

        let lock = InstallLock::acquire(dir.path()).unwrap();
        let second = InstallLock::acquire(dir.path());
        assert!(second.is_err());
        assert!(second
            .unwrap_err()
            .to_string()
            .contains("already running"));

        drop(lock);
        let third = InstallLock::acquire(dir.path());
        assert!(third.is_ok());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // A pid that cannot exist: pid_max on Linux is < 2^22.
        fs::write(dir.path().join(LOCK_FILE), "4999999").unwrap();

        let lock = InstallLock::acquire(dir.path());
        assert!(lock.is_ok());
    }
}
