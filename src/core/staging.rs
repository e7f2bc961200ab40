/// Staging directory ownership
///
/// Snapshot bundles and restore extractions live in random-suffixed,
/// owner-only directories that must never outlive the invocation: they
/// hold unencrypted dumps of customer data. Removal is guaranteed two
/// ways: RAII drop on every normal/error path, and a process-wide registry
/// the signal handler drains before exiting.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::utils::helpers::random_suffix;

static REGISTRY: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

const SUFFIX_LEN: usize = 12;
const CREATE_ATTEMPTS: u32 = 5;

pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create `<base>/<prefix><random>` with mode 700. The create is
    /// exclusive, so a suffix collision is retried with a fresh one.
    pub fn create(base: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(base)
            .with_context(|| format!("failed to create {}", base.display()))?;

        for _ in 0..CREATE_ATTEMPTS {
            let path = base.join(format!("{}{}", prefix, random_suffix(SUFFIX_LEN)));
            match fs::DirBuilder::new().mode(0o700).create(&path) {
                Ok(()) => {
                    register(&path);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create staging directory {}", path.display())
                    });
                }
            }
        }

        bail!(
            "could not allocate a staging directory under {}",
            base.display()
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create (if needed) and return a subdirectory of the staging tree.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.path.join(name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "failed to remove staging directory {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
        deregister(&self.path);
    }
}

fn register(path: &Path) {
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.push(path.to_path_buf());
    }
}

fn deregister(path: &Path) {
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.retain(|p| p != path);
    }
}

/// Remove every live staging directory. Called from the signal handler,
/// where destructors will not run.
pub fn cleanup_registered() {
    let paths: Vec<PathBuf> = match REGISTRY.lock() {
        Ok(mut registry) => registry.drain(..).collect(),
        Err(_) => return,
    };
    for path in paths {
        let _ = fs::remove_dir_all(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_create_is_owner_only_and_random() {
        let base = tempfile::tempdir().unwrap();

        let a = StagingDir::create(base.path(), "bundle-").unwrap();
        let b = StagingDir::create(base.path(), "bundle-").unwrap();
        assert_ne!(a.path(), b.path());

        let mode = fs::metadata(a.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let sub = a.subdir("databases").unwrap();
        assert!(sub.is_dir());
    }

    #[test]
    fn test_drop_removes_directory() {
        let base = tempfile::tempdir().unwrap();

        let staging = StagingDir::create(base.path(), "bundle-").unwrap();
        let path = staging.path().to_path_buf();
        fs::write(path.join("dump.sql"), "data").unwrap();

        drop(staging);
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_registered_covers_live_directories() {
        let base = tempfile::tempdir().unwrap();

        let staging = StagingDir::create(base.path(), "bundle-").unwrap();
        let path = staging.path().to_path_buf();

        cleanup_registered();
        assert!(!path.exists());

        // Drop after the registry sweep must not error.
        drop(staging);
    }
}
