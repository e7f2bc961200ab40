/// Snapshot pipeline
///
/// Produces exactly one new repository snapshot containing a consistent
/// bundle, or fails loudly with no partial snapshot committed. Steps run
/// in strict order: preflight, staging, database export, volume export,
/// config export, (engine) tenant/home export, manifest, upload,
/// retention. Database and volume export use soft-failure semantics per
/// item, but a mandatory category that produced nothing at all aborts the
/// run before upload.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::core::deployment::{DatabaseSpec, DeploymentProfile, DumpScope, DumpUser};
use crate::core::env_file::EnvFile;
use crate::core::manifest::{ComponentEntry, Manifest};
use crate::core::outcome::{PipelineReport, StepOutcome};
use crate::core::repository::RepositoryClient;
use crate::core::runtime::RuntimeManager;
use crate::core::staging::StagingDir;
use crate::utils::constants::*;
use crate::utils::helpers::{copy_tree, format_bytes, hostname};
use crate::utils::progress::SizeWatcher;
use crate::utils::settings::Settings;

pub struct SnapshotOutcome {
    pub snapshot_id: Option<String>,
    pub bundle_bytes: u64,
    pub duration: Duration,
    pub soft_failures: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CategoryCount {
    attempted: usize,
    succeeded: usize,
}

pub struct SnapshotPipeline<'a> {
    profile: &'a DeploymentProfile,
    settings: &'a Settings,
    runtime: &'a RuntimeManager,
    repo: &'a RepositoryClient,
    report: PipelineReport,
}

impl<'a> SnapshotPipeline<'a> {
    pub fn new(
        profile: &'a DeploymentProfile,
        settings: &'a Settings,
        runtime: &'a RuntimeManager,
        repo: &'a RepositoryClient,
    ) -> Self {
        Self {
            profile,
            settings,
            runtime,
            repo,
            report: PipelineReport::new(),
        }
    }

    pub async fn run(&mut self) -> Result<SnapshotOutcome> {
        let started = Instant::now();
        let host = hostname();

        self.preflight().await?;

        let staging = StagingDir::create(&self.settings.staging_dir, STAGING_PREFIX)?;
        tracing::info!("staging bundle in {}", staging.path().display());

        let env = EnvFile::load_or_empty(&self.profile.env_file);

        let databases = self.export_databases(&staging, &env).await?;
        let volumes = self.export_volumes(&staging).await?;
        let config_items = self.export_config(&staging)?;

        let mut users_items = 0usize;
        let mut home_items = 0usize;
        if self.profile.variant.is_engine() {
            users_items = self.export_tree_component(
                &staging,
                BUNDLE_USERS,
                self.profile.tenant_root(),
                "tenant project tree",
            )
            .await;
            home_items = self.export_tree_component(
                &staging,
                BUNDLE_HOME,
                self.profile.home_root(),
                "home tree",
            )
            .await;
        }

        // Core data capture failing wholesale means the bundle is not worth
        // keeping; nothing may be uploaded.
        if mandatory_category_failed(databases.attempted, databases.succeeded) {
            bail!("no database dump could be produced; aborting before upload");
        }
        if mandatory_category_failed(volumes.attempted, volumes.succeeded) {
            bail!("no volume archive could be produced; aborting before upload");
        }

        let bundle_bytes = dir_size(staging.path());

        let mut components = vec![
            ComponentEntry {
                name: TAG_DATABASES.into(),
                items: databases.succeeded,
            },
            ComponentEntry {
                name: TAG_VOLUMES.into(),
                items: volumes.succeeded,
            },
            ComponentEntry {
                name: TAG_CONFIG.into(),
                items: config_items,
            },
        ];
        if users_items > 0 {
            components.push(ComponentEntry {
                name: TAG_USERS.into(),
                items: users_items,
            });
        }
        if home_items > 0 {
            components.push(ComponentEntry {
                name: TAG_HOME.into(),
                items: home_items,
            });
        }

        Manifest {
            created_at: chrono::Utc::now(),
            hostname: host.clone(),
            variant: self.profile.variant.effective().as_str().to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            components: components.clone(),
            total_bytes: bundle_bytes,
            duration_secs: started.elapsed().as_secs(),
        }
        .write_to(staging.path())?;

        self.repo.init().await?;

        let tag_names: Vec<&str> = components
            .iter()
            .filter(|c| c.items > 0)
            .map(|c| c.name.as_str())
            .collect();
        let tags = build_tags(&host, &tag_names);

        tracing::info!(
            "uploading {} bundle ({})",
            self.profile.variant.effective().as_str(),
            format_bytes(bundle_bytes)
        );
        let snapshot_id = self.repo.backup(staging.path(), &tags).await?;
        match &snapshot_id {
            Some(id) => tracing::info!("created snapshot {}", id),
            None => self.report.soft(
                "snapshot uploaded but its id could not be read from the engine output",
            ),
        }

        // Retention is best-effort; a successful backup must never be
        // reported as failed because pruning old ones did not work.
        if let Err(e) = self
            .repo
            .forget_older_than(&host, self.settings.retention_days)
            .await
        {
            tracing::warn!("retention pruning failed: {e:#}");
        }

        tracing::info!("{}", self.report.summary("snapshot"));

        Ok(SnapshotOutcome {
            snapshot_id,
            bundle_bytes,
            duration: started.elapsed(),
            soft_failures: self.report.soft_failures().to_vec(),
        })
    }

    /// Everything here runs before any local state is created; any failure
    /// is fatal with nothing to clean up.
    async fn preflight(&self) -> Result<()> {
        self.settings.require_repository()?;

        if !RepositoryClient::binary_available().await {
            bail!("backup engine binary 'restic' not found on PATH; install restic and rerun");
        }

        if !self.runtime.ping().await {
            bail!("container runtime is not reachable; is the Docker daemon running?");
        }

        if !self.profile.install_root.exists() {
            bail!(
                "install directory {} does not exist",
                self.profile.install_root.display()
            );
        }

        let services = self
            .runtime
            .compose_services()
            .context("installation has no readable compose definition")?;
        if !services.iter().any(|s| s == DB_SERVICE) {
            tracing::warn!(
                "compose definition does not declare a '{}' service",
                DB_SERVICE
            );
        }

        let estimate = self
            .runtime
            .volume_size_estimate(&self.profile.volumes)
            .await;
        if let Some(free) = free_space_for(&self.settings.staging_dir) {
            let required = estimate + FREE_SPACE_MARGIN_BYTES;
            if free < required {
                bail!(
                    "insufficient free space for staging: {} available, {} required \
                     (estimated bundle {} + safety margin)",
                    format_bytes(free),
                    format_bytes(required),
                    format_bytes(estimate)
                );
            }
        }

        Ok(())
    }

    async fn export_databases(
        &mut self,
        staging: &StagingDir,
        env: &EnvFile,
    ) -> Result<CategoryCount> {
        let dir = staging.subdir(BUNDLE_DATABASES)?;
        let mut count = CategoryCount::default();

        for spec in self.profile.databases.clone() {
            count.attempted += 1;
            let result = self.export_one_database(&spec, env, &dir).await;
            match result {
                Ok(bytes) => {
                    tracing::info!("dumped database {} ({})", spec.name, format_bytes(bytes));
                    count.succeeded += 1;
                }
                Err(e) => {
                    self.report
                        .soft(format!("database {}: {:#}", spec.name, e));
                }
            }
        }

        Ok(count)
    }

    async fn export_one_database(
        &self,
        spec: &DatabaseSpec,
        env: &EnvFile,
        dir: &Path,
    ) -> Result<u64> {
        let container = self
            .runtime
            .service_container_id(spec.service)
            .await?
            .with_context(|| format!("service {} has no running container", spec.service))?;

        let user = match spec.user {
            DumpUser::Root => "root".to_string(),
            DumpUser::App => env.get_or(DB_USER_KEY, DB_USER_DEFAULT).to_string(),
        };
        let password = env
            .get(spec.password_key)
            .with_context(|| {
                format!(
                    "{} is not set in {}",
                    spec.password_key,
                    env.path().display()
                )
            })?
            .to_string();
        let creds: &[(&str, &str)] = &[("MYSQL_PWD", password.as_str())];

        // Cheap connectivity probe before committing to a long dump.
        let probe = self
            .runtime
            .exec_sh(
                &container,
                &format!("mysql -u{} -N -e 'SELECT 1'", user),
                creds,
                PROBE_TIMEOUT,
            )
            .await?;
        if !probe.success() {
            bail!("connectivity probe failed: {}", probe.stderr.trim());
        }

        let dump_opts = "--single-transaction --routines --triggers --skip-lock-tables";
        match spec.scope {
            DumpScope::Single => {
                let outfile = dir.join(format!("{}.sql", spec.name));
                let watcher =
                    SizeWatcher::spawn(outfile.clone(), format!("dumping {}", spec.name));
                let result = self
                    .runtime
                    .exec_sh_to_file(
                        &container,
                        &format!("mysqldump {} -u{} {}", dump_opts, user, spec.name),
                        creds,
                        &outfile,
                        DUMP_TIMEOUT,
                    )
                    .await;
                watcher.finish();
                let exec = result?;

                if !database_dump_succeeded(exec.code, &outfile) {
                    bail!(
                        "dump rejected (exit {:?}, {} bytes): {}",
                        exec.code,
                        file_size(&outfile),
                        exec.stderr.trim()
                    );
                }
                Ok(file_size(&outfile))
            }
            DumpScope::AllDatabases => {
                // The multi-database export is streamed through gzip; a
                // compression failure falls back to the uncompressed form.
                let gz = dir.join(format!("{}.sql.gz", spec.name));
                let watcher = SizeWatcher::spawn(gz.clone(), format!("dumping {}", spec.name));
                let result = self
                    .runtime
                    .exec_sh_to_file(
                        &container,
                        &format!("mysqldump {} --all-databases -u{} | gzip", dump_opts, user),
                        creds,
                        &gz,
                        BULK_DUMP_TIMEOUT,
                    )
                    .await;
                watcher.finish();

                if let Ok(exec) = result {
                    if database_dump_succeeded(exec.code, &gz) {
                        return Ok(file_size(&gz));
                    }
                    tracing::warn!(
                        "compressed dump of {} rejected (exit {:?}); retrying uncompressed",
                        spec.name,
                        exec.code
                    );
                }
                let _ = std::fs::remove_file(&gz);

                let plain = dir.join(format!("{}.sql", spec.name));
                let watcher =
                    SizeWatcher::spawn(plain.clone(), format!("dumping {}", spec.name));
                let result = self
                    .runtime
                    .exec_sh_to_file(
                        &container,
                        &format!("mysqldump {} --all-databases -u{}", dump_opts, user),
                        creds,
                        &plain,
                        BULK_DUMP_TIMEOUT,
                    )
                    .await;
                watcher.finish();
                let exec = result?;

                if !database_dump_succeeded(exec.code, &plain) {
                    bail!(
                        "dump rejected (exit {:?}, {} bytes): {}",
                        exec.code,
                        file_size(&plain),
                        exec.stderr.trim()
                    );
                }
                Ok(file_size(&plain))
            }
        }
    }

    async fn export_volumes(&mut self, staging: &StagingDir) -> Result<CategoryCount> {
        let dir = staging.subdir(BUNDLE_VOLUMES)?;
        let mut count = CategoryCount::default();

        for volume in self.profile.volumes.clone() {
            let exists = self.runtime.volume_exists(&volume).await;
            match exists {
                Ok(true) => {}
                Ok(false) => {
                    self.report
                        .soft(format!("volume {} does not exist; skipping", volume));
                    continue;
                }
                Err(e) => {
                    self.report.soft(format!("volume {}: {:#}", volume, e));
                    continue;
                }
            }

            count.attempted += 1;
            let archive = dir.join(format!("{}.tar.gz", volume));
            let watcher = SizeWatcher::spawn(archive.clone(), format!("archiving {}", volume));
            let result = self
                .runtime
                .archive_volume(&volume, &dir, VOLUME_TIMEOUT)
                .await;
            watcher.finish();

            let outcome = match result {
                Ok(exec) => {
                    // Archivers report warning exits when live files mutate
                    // mid-archive; the artifact is what counts.
                    if volume_archive_succeeded(exec.code, &archive) {
                        if !exec.success() {
                            tracing::debug!(
                                "archiver for {} exited {:?} but produced a valid archive",
                                volume,
                                exec.code
                            );
                        }
                        StepOutcome::Success
                    } else {
                        StepOutcome::Soft(format!(
                            "volume {}: archive missing or truncated (exit {:?}): {}",
                            volume,
                            exec.code,
                            exec.stderr.trim()
                        ))
                    }
                }
                Err(e) => StepOutcome::Soft(format!("volume {}: {:#}", volume, e)),
            };

            if self.report.record(outcome) {
                tracing::info!(
                    "archived volume {} ({})",
                    volume,
                    format_bytes(file_size(&archive))
                );
                count.succeeded += 1;
            }
        }

        Ok(count)
    }

    /// Copy configuration and TLS material into the bundle. Everything
    /// here is optional: missing items are logged and skipped.
    fn export_config(&mut self, staging: &StagingDir) -> Result<usize> {
        let dir = staging.subdir(BUNDLE_CONFIG)?;
        let mut items = 0usize;

        let compose = self.profile.compose_file();
        match std::fs::copy(&compose, dir.join(COMPOSE_FILE)) {
            Ok(_) => items += 1,
            Err(e) => self
                .report
                .soft(format!("compose file {}: {}", compose.display(), e)),
        }

        let env_file = &self.profile.env_file;
        if env_file.exists() {
            let name = env_file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| ENV_FILE.to_string());
            match std::fs::copy(env_file, dir.join(name)) {
                Ok(_) => items += 1,
                Err(e) => self
                    .report
                    .soft(format!("env file {}: {}", env_file.display(), e)),
            }
        } else {
            self.report
                .soft(format!("env file {} not found", env_file.display()));
        }

        let extensions = self.profile.install_root.join(EXTENSIONS_DIR);
        if extensions.is_dir() {
            match crate::utils::helpers::copy_dir_filtered(
                &extensions,
                &dir.join(EXTENSIONS_DIR),
                &[".git", "node_modules", "logs"],
            ) {
                Ok(copied) => items += copied as usize,
                Err(e) => self.report.soft(format!("extensions directory: {:#}", e)),
            }
        }

        let ssl = self.profile.install_root.join(SSL_DIR);
        if ssl.is_dir() {
            match crate::utils::helpers::copy_dir_filtered(&ssl, &dir.join(SSL_DIR), &[]) {
                Ok(copied) => items += copied as usize,
                Err(e) => self.report.soft(format!("ssl directory: {:#}", e)),
            }
        } else {
            tracing::debug!("no ssl directory at {}", ssl.display());
        }

        // The orchestrator's own settings ride along so a bare replacement
        // host can restore and reconnect. The bundle is owner-only and the
        // repository encrypts it at rest.
        let own_config = Settings::config_path();
        if own_config.exists() {
            match std::fs::copy(&own_config, dir.join("hostforge-backup.toml")) {
                Ok(_) => items += 1,
                Err(e) => self
                    .report
                    .soft(format!("settings file {}: {}", own_config.display(), e)),
            }
        }

        Ok(items)
    }

    /// Engine tree export (tenant projects, home). Returns the number of
    /// files captured; failures are soft.
    async fn export_tree_component(
        &mut self,
        staging: &StagingDir,
        bundle_dir: &str,
        source: Option<std::path::PathBuf>,
        what: &str,
    ) -> usize {
        let Some(source) = source else { return 0 };
        if !source.is_dir() {
            self.report
                .soft(format!("{} {} not found", what, source.display()));
            return 0;
        }

        let dest = match staging.subdir(bundle_dir) {
            Ok(dest) => dest,
            Err(e) => {
                self.report.soft(format!("{}: {:#}", what, e));
                return 0;
            }
        };

        match copy_tree(&source, &dest, TREE_COPY_TIMEOUT).await {
            Ok(()) => {
                let files = count_files(&dest);
                tracing::info!("captured {} ({} files)", what, files);
                files
            }
            Err(e) => {
                self.report.soft(format!("{}: {:#}", what, e));
                0
            }
        }
    }
}

/// A dump must both exit cleanly and clear the minimum-size threshold; a
/// tiny file is certainly truncated even when the client reported success.
pub(crate) fn database_dump_succeeded(exit_code: Option<i32>, dump: &Path) -> bool {
    exit_code == Some(0) && artifact_ok(dump, MIN_DUMP_BYTES)
}

/// Volume archives are judged by the artifact alone, never by the
/// archiver's exit status.
pub(crate) fn volume_archive_succeeded(_exit_code: Option<i32>, archive: &Path) -> bool {
    artifact_ok(archive, MIN_ARCHIVE_BYTES)
}

pub(crate) fn artifact_ok(path: &Path, min_bytes: u64) -> bool {
    file_size(path) >= min_bytes
}

pub(crate) fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// A mandatory category failed when every attempt errored. No attempts at
/// all (fresh install with no volumes yet) is not an error.
pub(crate) fn mandatory_category_failed(attempted: usize, succeeded: usize) -> bool {
    attempted > 0 && succeeded == 0
}

/// Snapshot tags: host identity, product, then one per component present.
pub(crate) fn build_tags(host: &str, components: &[&str]) -> Vec<String> {
    let mut tags = vec![host.to_string(), PRODUCT_TAG.to_string()];
    tags.extend(components.iter().map(|c| c.to_string()));
    tags
}

pub(crate) fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let Ok(file_type) = entry.file_type() else {
                return 0;
            };
            if file_type.is_dir() {
                dir_size(&entry.path())
            } else if file_type.is_file() {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            } else {
                0
            }
        })
        .sum()
}

/// Free space on the filesystem backing `path`, from the mount whose
/// mount point is the longest prefix of it.
fn free_space_for(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

fn count_files(path: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let Ok(file_type) = entry.file_type() else {
                return 0;
            };
            if file_type.is_dir() {
                count_files(&entry.path())
            } else {
                1
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_small_dump_rejected_even_on_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("panel.sql");
        fs::write(&dump, "-- empty --").unwrap();

        assert!(!database_dump_succeeded(Some(0), &dump));

        fs::write(&dump, "x".repeat(MIN_DUMP_BYTES as usize)).unwrap();
        assert!(database_dump_succeeded(Some(0), &dump));
        assert!(!database_dump_succeeded(Some(2), &dump));
    }

    #[test]
    fn test_archive_warning_exit_is_success_when_artifact_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("hostforge_db_data.tar.gz");
        fs::write(&archive, vec![0u8; 4096]).unwrap();

        // tar exits 1 when source files change mid-archive; the artifact
        // decides.
        assert!(volume_archive_succeeded(Some(1), &archive));
        assert!(volume_archive_succeeded(Some(0), &archive));
    }

    #[test]
    fn test_missing_or_tiny_archive_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("missing.tar.gz");

        assert!(!volume_archive_succeeded(Some(0), &archive));

        fs::write(&archive, "tiny").unwrap();
        assert!(!volume_archive_succeeded(Some(0), &archive));
    }

    #[test]
    fn test_mandatory_category_rule() {
        assert!(mandatory_category_failed(2, 0));
        assert!(!mandatory_category_failed(2, 1));
        assert!(!mandatory_category_failed(0, 0));
    }

    #[test]
    fn test_build_tags() {
        let tags = build_tags("host-a", &["databases", "volumes", "config"]);
        assert_eq!(
            tags,
            vec!["host-a", "hostforge", "databases", "volumes", "config"]
        );
    }

    #[test]
    fn test_dir_size_recurses() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b"), vec![0u8; 50]).unwrap();

        assert_eq!(dir_size(dir.path()), 150);
        assert_eq!(dir_size(Path::new("/nonexistent")), 0);
    }
}
