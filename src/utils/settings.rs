/// Orchestrator settings
///
/// One centralized file at /etc/hostforge-backup/config.toml (mode 600,
/// owner-only) holding the repository locator, credentials and directory
/// layout. A legacy dotfile location is detected and migrated automatically
/// on first load. Environment variables override file values, which is how
/// detached and cron-driven runs are parameterized.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::utils::constants::DEFAULT_RETENTION_DAYS;

pub const ENV_REPOSITORY: &str = "HOSTFORGE_BACKUP_REPOSITORY";
pub const ENV_PASSWORD: &str = "HOSTFORGE_BACKUP_PASSWORD";
pub const ENV_S3_ACCESS_KEY: &str = "HOSTFORGE_BACKUP_S3_ACCESS_KEY";
pub const ENV_S3_SECRET_KEY: &str = "HOSTFORGE_BACKUP_S3_SECRET_KEY";
pub const ENV_RETENTION_DAYS: &str = "HOSTFORGE_BACKUP_RETENTION_DAYS";
pub const ENV_SCHEDULE_HOUR: &str = "HOSTFORGE_BACKUP_HOUR";
pub const ENV_STAGING_DIR: &str = "HOSTFORGE_BACKUP_STAGING_DIR";
pub const ENV_CACHE_DIR: &str = "HOSTFORGE_BACKUP_CACHE_DIR";
pub const ENV_LOG_DIR: &str = "HOSTFORGE_BACKUP_LOG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Repository locator understood by the backup engine (local path,
    /// sftp:, s3:, ...).
    pub repository: Option<String>,

    /// Repository encryption passphrase. Handed to the engine through its
    /// environment, never through argv.
    pub password: Option<String>,

    /// Object-storage credentials, exported to the engine's environment
    /// only for operations that need them.
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Hour-of-day for scheduled snapshots. Stored here, consumed only by
    /// the external cron glue.
    pub schedule_hour: Option<u8>,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostforge-backup/staging")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/hostforge-backup")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/hostforge-backup")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repository: None,
            password: None,
            s3_access_key: None,
            s3_secret_key: None,
            retention_days: default_retention_days(),
            schedule_hour: None,
            staging_dir: default_staging_dir(),
            cache_dir: default_cache_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl Settings {
    pub fn config_path() -> PathBuf {
        PathBuf::from("/etc/hostforge-backup/config.toml")
    }

    pub fn legacy_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".hostforge-backup.toml"))
    }

    /// Load settings from the canonical path, migrating the legacy dotfile
    /// if that is all that exists, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut settings =
            Self::load_from(&Self::config_path(), Self::legacy_path().as_deref())?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Load from an explicit path. A missing file yields defaults; a legacy
    /// file is migrated into place first.
    pub fn load_from(path: &Path, legacy: Option<&Path>) -> Result<Self> {
        if !path.exists() {
            if let Some(legacy) = legacy.filter(|l| l.exists()) {
                tracing::info!(
                    "migrating settings from {} to {}",
                    legacy.display(),
                    path.display()
                );
                let contents = fs::read_to_string(legacy)
                    .with_context(|| format!("failed to read {}", legacy.display()))?;
                let settings: Self = toml::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", legacy.display()))?;
                settings.save_to(path)?;
                fs::remove_file(legacy).ok();
                return Ok(settings);
            }
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write the settings file with owner-only permissions. It holds the
    /// repository passphrase in the clear; the file mode is the protection.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to chmod {}", path.display()))?;

        Ok(())
    }

    /// Apply environment-variable overrides via the supplied lookup.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get(ENV_REPOSITORY) {
            self.repository = Some(v);
        }
        if let Some(v) = get(ENV_PASSWORD) {
            self.password = Some(v);
        }
        if let Some(v) = get(ENV_S3_ACCESS_KEY) {
            self.s3_access_key = Some(v);
        }
        if let Some(v) = get(ENV_S3_SECRET_KEY) {
            self.s3_secret_key = Some(v);
        }
        if let Some(v) = get(ENV_RETENTION_DAYS).and_then(|v| v.parse().ok()) {
            self.retention_days = v;
        }
        if let Some(v) = get(ENV_SCHEDULE_HOUR).and_then(|v| v.parse().ok()) {
            self.schedule_hour = Some(v);
        }
        if let Some(v) = get(ENV_STAGING_DIR) {
            self.staging_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(v);
        }
    }

    /// Repository locator and passphrase, or a fatal error carrying the
    /// remediation hint.
    pub fn require_repository(&self) -> Result<(&str, &str)> {
        match (self.repository.as_deref(), self.password.as_deref()) {
            (Some(repo), Some(pass)) if !repo.is_empty() && !pass.is_empty() => {
                Ok((repo, pass))
            }
            _ => anyhow::bail!(
                "repository is not configured; set repository and password in {} \
                 (or {} / {}), then run 'hostforge-backup test-connection'",
                Self::config_path().display(),
                ENV_REPOSITORY,
                ENV_PASSWORD
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            Settings::load_from(&dir.path().join("config.toml"), None).unwrap();
        assert!(settings.repository.is_none());
        assert_eq!(settings.retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[test]
    fn test_save_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.repository = Some("s3:https://store/bucket".into());
        settings.password = Some("secret".into());
        settings.save_to(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = Settings::load_from(&path, None).unwrap();
        assert_eq!(loaded.repository.as_deref(), Some("s3:https://store/bucket"));
    }

    #[test]
    fn test_legacy_file_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("config.toml");
        let legacy = dir.path().join(".hostforge-backup.toml");

        fs::write(&legacy, "repository = \"/srv/backups\"\npassword = \"pw\"\n").unwrap();

        let settings = Settings::load_from(&path, Some(&legacy)).unwrap();
        assert_eq!(settings.repository.as_deref(), Some("/srv/backups"));
        assert!(path.exists());
        assert!(!legacy.exists());
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let mut settings = Settings {
            repository: Some("/old".into()),
            ..Settings::default()
        };

        settings.apply_overrides(|key| match key {
            ENV_REPOSITORY => Some("/new".to_string()),
            ENV_RETENTION_DAYS => Some("30".to_string()),
            ENV_SCHEDULE_HOUR => Some("not-a-number".to_string()),
            _ => None,
        });

        assert_eq!(settings.repository.as_deref(), Some("/new"));
        assert_eq!(settings.retention_days, 30);
        assert_eq!(settings.schedule_hour, None);
    }

    #[test]
    fn test_require_repository() {
        let settings = Settings::default();
        assert!(settings.require_repository().is_err());

        let settings = Settings {
            repository: Some("/srv/backups".into()),
            password: Some("pw".into()),
            ..Settings::default()
        };
        let (repo, pass) = settings.require_repository().unwrap();
        assert_eq!(repo, "/srv/backups");
        assert_eq!(pass, "pw");
    }
}
