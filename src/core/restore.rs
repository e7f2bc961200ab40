/// Restore pipeline
///
/// Rebuilds local state from one repository snapshot: teardown, clean-slate
/// database volumes, config restore, database import, volume extraction,
/// (engine) tenant/home trees, service restart. Teardown-before-restore
/// ordering is a correctness requirement: stale database volumes must not
/// coexist with a freshly imported logical dump. Nothing destructive
/// happens before the snapshot id is resolved, the bundle is extracted and
/// the operator has confirmed.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::deployment::{DatabaseSpec, DeploymentProfile, DumpScope};
use crate::core::env_file::EnvFile;
use crate::core::outcome::PipelineReport;
use crate::core::repository::RepositoryClient;
use crate::core::runtime::RuntimeManager;
use crate::core::staging::StagingDir;
use crate::utils::constants::*;
use crate::utils::helpers::{copy_dir_filtered, copy_tree, hostname, local_ip};
use crate::utils::settings::Settings;

pub struct RestoreOutcome {
    pub snapshot_id: String,
    pub duration: Duration,
    pub soft_failures: Vec<String>,
}

pub struct RestorePipeline<'a> {
    profile: &'a DeploymentProfile,
    settings: &'a Settings,
    runtime: &'a RuntimeManager,
    repo: &'a RepositoryClient,
    report: PipelineReport,
}

impl<'a> RestorePipeline<'a> {
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

    pub async fn run(&mut self, requested: &str, assume_yes: bool) -> Result<RestoreOutcome> {
        let started = Instant::now();
        let host = hostname();

        // Resolve to a concrete id before touching anything.
        let snapshot_id = self.repo.resolve(requested, &host).await?;
        tracing::info!("restoring snapshot {}", snapshot_id);

        let extraction = StagingDir::create(&self.settings.staging_dir, RESTORE_PREFIX)?;
        self.repo.restore(&snapshot_id, extraction.path()).await?;

        let bundle = locate_bundle_root(extraction.path())?;
        tracing::debug!("bundle root at {}", bundle.display());

        // The one safety gate: everything after this overwrites local state.
        if !assume_yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Restore snapshot {} over the installation at {}? \
                     This stops all services and overwrites local data",
                    snapshot_id,
                    self.profile.install_root.display()
                ))
                .default(false)
                .interact()
                .context("could not read confirmation; rerun with --yes for unattended use")?;
            if !confirmed {
                bail!("restore cancelled; no local state was modified");
            }
        }

        self.runtime
            .compose_down()
            .await
            .context("failed to stop running services")?;

        // Clean slate for the database engine: mixing old on-disk files
        // with a fresh logical import invites crash-recovery corruption.
        for volume in self.profile.db_volumes() {
            if self.runtime.volume_exists(volume).await? {
                self.runtime.remove_volume(volume).await?;
                tracing::info!("removed database volume {}", volume);
            }
        }

        let env_path = self.restore_config(&bundle)?;

        self.start_database().await?;

        let env = EnvFile::load_or_empty(&env_path);
        let container = self
            .runtime
            .service_container_id(DB_SERVICE)
            .await?
            .ok_or_else(|| anyhow!("database service has no running container"))?;
        let root_pw = self.bootstrap_root_password(&container, &env).await;

        for spec in self.profile.databases.clone() {
            self.restore_database(&spec, &bundle, &container, root_pw.as_deref(), &env)
                .await
                .with_context(|| format!("restore of database {} failed", spec.name))?;
        }

        if !self.profile.variant.is_engine() {
            self.rewrite_server_identity(&container, root_pw.as_deref(), &host)
                .await?;
        }

        self.restore_volumes(&bundle).await?;

        if self.profile.variant.is_engine() {
            self.restore_tree(
                &bundle.join(BUNDLE_USERS),
                self.profile.tenant_root(),
                "tenant project tree",
            )
            .await?;
            self.restore_tree(
                &bundle.join(BUNDLE_HOME),
                self.profile.home_root(),
                "home tree",
            )
            .await?;
        }

        self.runtime.compose_up(&[]).await?;
        tokio::time::sleep(SERVICE_SETTLE).await;

        // Advisory only: the restore is structurally complete once data
        // import succeeded, whatever the services report right now.
        match self.runtime.compose_running_services().await {
            Ok(running) if running.is_empty() => {
                tracing::warn!("no services report a running state yet; check the logs")
            }
            Ok(running) => tracing::info!("services running: {}", running.join(", ")),
            Err(e) => tracing::warn!("post-restore service check failed: {e:#}"),
        }

        tracing::info!("{}", self.report.summary("restore"));

        Ok(RestoreOutcome {
            snapshot_id,
            duration: started.elapsed(),
            soft_failures: self.report.soft_failures().to_vec(),
        })
    }

    /// Put compose definition, env file and TLS material back into the
    /// install root. Compose and env failures are fatal; decorative
    /// material is soft. Returns the path of the restored env file.
    fn restore_config(&mut self, bundle: &Path) -> Result<PathBuf> {
        let config = bundle.join(BUNDLE_CONFIG);
        if !config.is_dir() {
            bail!("bundle has no config directory; refusing to continue");
        }

        std::fs::create_dir_all(&self.profile.install_root).with_context(|| {
            format!("failed to create {}", self.profile.install_root.display())
        })?;

        let compose_src = config.join(COMPOSE_FILE);
        if !compose_src.is_file() {
            bail!("bundle contains no compose definition");
        }
        std::fs::copy(&compose_src, self.profile.compose_file())
            .context("failed to restore compose definition")?;

        let env_path = match pick_env_source(&config) {
            Some((src, name)) => {
                let dest = self.profile.install_root.join(name);
                std::fs::copy(&src, &dest).context("failed to restore env file")?;
                dest
            }
            None => bail!("bundle contains no env file"),
        };

        for dir_name in [SSL_DIR, EXTENSIONS_DIR] {
            let src = config.join(dir_name);
            if src.is_dir() {
                if let Err(e) =
                    copy_dir_filtered(&src, &self.profile.install_root.join(dir_name), &[])
                {
                    self.report.soft(format!("{} restore: {:#}", dir_name, e));
                }
            }
        }

        Ok(env_path)
    }

    /// Bring up only the database service and wait for liveness. One
    /// volume-clean-and-restart cycle is attempted before giving up.
    async fn start_database(&mut self) -> Result<()> {
        self.runtime.compose_up(&[DB_SERVICE]).await?;
        if self.wait_for_database().await {
            return Ok(());
        }

        tracing::warn!("database engine not ready; resetting its volume and retrying once");
        self.runtime.compose_stop(&[DB_SERVICE]).await?;
        for volume in self.profile.db_volumes() {
            if self.runtime.volume_exists(volume).await? {
                self.runtime.remove_volume(volume).await?;
            }
        }
        self.runtime.compose_up(&[DB_SERVICE]).await?;

        if self.wait_for_database().await {
            Ok(())
        } else {
            bail!(
                "database engine did not become ready after {} attempts and one volume reset",
                DB_WAIT_ATTEMPTS
            )
        }
    }

    /// Lightweight, unauthenticated liveness probe at fixed intervals.
    /// "Access denied" still means the server is answering.
    async fn wait_for_database(&self) -> bool {
        for _ in 0..DB_WAIT_ATTEMPTS {
            if let Ok(Some(container)) = self.runtime.service_container_id(DB_SERVICE).await {
                if let Ok(out) = self
                    .runtime
                    .exec_sh(&container, "mysqladmin ping", &[], PROBE_TIMEOUT)
                    .await
                {
                    let text = format!("{}{}", out.stdout_str(), out.stderr);
                    if text.contains("alive") || text.contains("Access denied") {
                        return true;
                    }
                }
            }
            tokio::time::sleep(DB_WAIT_INTERVAL).await;
        }
        false
    }

    /// Fresh-container bootstrap ritual: try passwordless root, then root
    /// passwords from the container environment, then from the env file.
    /// Kept two-stage for compatibility with uninitialized containers;
    /// worth hardening, since a misconfigured credential can hide behind a
    /// permissive fallback.
    async fn bootstrap_root_password(
        &self,
        container: &str,
        env: &EnvFile,
    ) -> Option<String> {
        if self.root_works(container, None).await {
            return None;
        }

        let mut candidates: Vec<String> = Vec::new();
        for key in ["MYSQL_ROOT_PASSWORD", "MARIADB_ROOT_PASSWORD"] {
            if let Ok(Some(pw)) = self.runtime.container_env(container, key).await {
                candidates.push(pw);
            }
        }
        if let Some(pw) = env.get(DB_ROOT_PASSWORD_KEY) {
            candidates.push(pw.to_string());
        }

        for pw in candidates {
            if self.root_works(container, Some(&pw)).await {
                return Some(pw);
            }
        }

        tracing::warn!(
            "could not verify root database access; continuing with the env-file root password"
        );
        env.get(DB_ROOT_PASSWORD_KEY).map(|pw| pw.to_string())
    }

    async fn root_works(&self, container: &str, password: Option<&str>) -> bool {
        let env: Vec<(&str, &str)> = password.map(|pw| ("MYSQL_PWD", pw)).into_iter().collect();
        matches!(
            self.runtime
                .exec_sh(container, "mysql -uroot -N -e 'SELECT 1'", &env, PROBE_TIMEOUT)
                .await,
            Ok(out) if out.success()
        )
    }

    async fn restore_database(
        &mut self,
        spec: &DatabaseSpec,
        bundle: &Path,
        container: &str,
        root_pw: Option<&str>,
        env: &EnvFile,
    ) -> Result<()> {
        let dumps = bundle.join(BUNDLE_DATABASES);
        let (dump, compressed) = find_dump(&dumps, spec.name)
            .ok_or_else(|| anyhow!("bundle contains no dump for {}", spec.name))?;

        let mut root_env: Vec<(&str, &str)> = Vec::new();
        if let Some(pw) = root_pw {
            root_env.push(("MYSQL_PWD", pw));
        }

        match spec.scope {
            DumpScope::Single => {
                self.ensure_app_user(container, root_pw, env).await;

                // Drop and recreate the schema; settle for
                // create-if-missing when the server refuses the drop.
                let recreate = format!(
                    "mysql -uroot -e 'DROP DATABASE IF EXISTS `{0}`; CREATE DATABASE `{0}`'",
                    spec.name
                );
                let out = self
                    .runtime
                    .exec_sh(container, &recreate, &root_env, PROBE_TIMEOUT)
                    .await?;
                if !out.success() {
                    tracing::warn!(
                        "drop/create of {} rejected ({}); falling back to create-if-missing",
                        spec.name,
                        out.stderr.trim()
                    );
                    let fallback = format!(
                        "mysql -uroot -e 'CREATE DATABASE IF NOT EXISTS `{}`'",
                        spec.name
                    );
                    let out = self
                        .runtime
                        .exec_sh(container, &fallback, &root_env, PROBE_TIMEOUT)
                        .await?;
                    if !out.success() {
                        bail!("could not create schema {}: {}", spec.name, out.stderr.trim());
                    }
                }

                let import = if compressed {
                    format!("gunzip -c | mysql -uroot {}", spec.name)
                } else {
                    format!("mysql -uroot {}", spec.name)
                };
                let out = self
                    .runtime
                    .exec_sh_from_file(container, &import, &root_env, &dump, BULK_DUMP_TIMEOUT)
                    .await?;
                if !out.success() {
                    bail!("import failed: {}", out.stderr.trim());
                }

                let tables = self.count_query(
                    container,
                    &root_env,
                    &format!(
                        "SELECT COUNT(*) FROM information_schema.tables \
                         WHERE table_schema='{}'",
                        spec.name
                    ),
                )
                .await?;
                if tables == 0 {
                    bail!("imported schema {} contains no tables", spec.name);
                }
                tracing::info!("database {} imported ({} tables)", spec.name, tables);
            }
            DumpScope::AllDatabases => {
                // The multi-database export carries its own CREATE DATABASE
                // statements.
                let import = if compressed {
                    "gunzip -c | mysql -uroot".to_string()
                } else {
                    "mysql -uroot".to_string()
                };
                let out = self
                    .runtime
                    .exec_sh_from_file(container, &import, &root_env, &dump, BULK_DUMP_TIMEOUT)
                    .await?;
                if !out.success() {
                    bail!("import failed: {}", out.stderr.trim());
                }

                let schemas = self.count_query(
                    container,
                    &root_env,
                    "SELECT COUNT(*) FROM information_schema.schemata \
                     WHERE schema_name NOT IN \
                     ('mysql','information_schema','performance_schema','sys')",
                )
                .await?;
                if schemas == 0 {
                    bail!("multi-database import produced no schemas");
                }
                tracing::info!("user databases imported ({} schemas)", schemas);
            }
        }

        Ok(())
    }

    /// Ensure the application-level database user exists. Best-effort:
    /// the import runs as root either way.
    async fn ensure_app_user(&self, container: &str, root_pw: Option<&str>, env: &EnvFile) {
        let Some(app_pw) = env.get(DB_PASSWORD_KEY) else {
            tracing::debug!("no {} in env file; skipping app user bootstrap", DB_PASSWORD_KEY);
            return;
        };
        let app_user = env.get_or(DB_USER_KEY, DB_USER_DEFAULT);

        let mut exec_env: Vec<(&str, &str)> =
            vec![("HF_APP_USER", app_user), ("HF_APP_PW", app_pw)];
        if let Some(pw) = root_pw {
            exec_env.push(("MYSQL_PWD", pw));
        }

        // The user/password reach the server via the container environment;
        // the script text itself carries no secrets.
        let script = "mysql -uroot -e \"CREATE USER IF NOT EXISTS '${HF_APP_USER}'@'%' \
                      IDENTIFIED BY '${HF_APP_PW}'; \
                      GRANT ALL PRIVILEGES ON *.* TO '${HF_APP_USER}'@'%'; \
                      FLUSH PRIVILEGES;\"";

        match self
            .runtime
            .exec_sh(container, script, &exec_env, PROBE_TIMEOUT)
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!("app user bootstrap failed: {}", out.stderr.trim()),
            Err(e) => tracing::warn!("app user bootstrap failed: {e:#}"),
        }
    }

    async fn count_query(
        &self,
        container: &str,
        root_env: &[(&str, &str)],
        query: &str,
    ) -> Result<u64> {
        let script = format!("mysql -uroot -N -B -e \"{}\"", query);
        let out = self
            .runtime
            .exec_sh(container, &script, root_env, PROBE_TIMEOUT)
            .await?;
        if !out.success() {
            bail!("verification query failed: {}", out.stderr.trim());
        }
        parse_count(&out.stdout_str())
            .ok_or_else(|| anyhow!("unexpected verification output: {}", out.stdout_str().trim()))
    }

    /// Control-panel only: the stored server identity must match the host
    /// we restored onto, or the panel rejects its own API traffic after a
    /// migration.
    async fn rewrite_server_identity(
        &mut self,
        container: &str,
        root_pw: Option<&str>,
        host: &str,
    ) -> Result<()> {
        let ip = local_ip();
        let schema = self
            .profile
            .databases
            .first()
            .map(|d| d.name)
            .unwrap_or("hostforge");

        let mut exec_env: Vec<(&str, &str)> =
            vec![("HF_SERVER_IP", ip.as_str()), ("HF_SERVER_HOST", host)];
        if let Some(pw) = root_pw {
            exec_env.push(("MYSQL_PWD", pw));
        }

        let update = format!(
            "mysql -uroot {} -e \"UPDATE settings SET value='${{HF_SERVER_IP}}' \
             WHERE name='server_address'; \
             UPDATE settings SET value='${{HF_SERVER_HOST}},${{HF_SERVER_IP}}' \
             WHERE name='trusted_hosts';\"",
            schema
        );
        let out = self
            .runtime
            .exec_sh(container, &update, &exec_env, PROBE_TIMEOUT)
            .await?;
        if !out.success() {
            bail!("failed to rewrite server identity: {}", out.stderr.trim());
        }

        let check = format!(
            "mysql -uroot -N -B {} -e \"SELECT value FROM settings WHERE name='server_address'\"",
            schema
        );
        let read_back = self
            .runtime
            .exec_sh(container, &check, &exec_env, PROBE_TIMEOUT)
            .await;
        match read_back {
            Ok(out) if out.stdout_str().trim() == ip => {
                tracing::info!("server identity rewritten to {} ({})", ip, host);
            }
            Ok(out) => self.report.soft(format!(
                "server identity read-back mismatch: expected {}, found {}",
                ip,
                out.stdout_str().trim()
            )),
            Err(e) => self
                .report
                .soft(format!("server identity read-back failed: {e:#}")),
        }

        Ok(())
    }

    /// Recreate data volumes from their archives. Database-engine volumes
    /// are skipped: the logical import already rebuilt them and extracting
    /// on top of a running engine would corrupt it.
    async fn restore_volumes(&mut self, bundle: &Path) -> Result<()> {
        let dir = bundle.join(BUNDLE_VOLUMES);
        if !dir.is_dir() {
            self.report.soft("bundle contains no volume archives");
            return Ok(());
        }

        let db_volumes = self.profile.db_volumes();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".tar.gz"))
            .collect();
        entries.sort();

        for archive in entries {
            let Some(volume) = volume_name_from_archive(&archive) else {
                continue;
            };
            if db_volumes.iter().any(|v| *v == volume) {
                tracing::debug!(
                    "skipping archive for {}; rebuilt via logical import",
                    volume
                );
                continue;
            }

            if self.runtime.volume_exists(&volume).await? {
                self.runtime.remove_volume(&volume).await?;
            }
            self.runtime.create_volume(&volume).await?;
            self.runtime
                .extract_volume(&volume, &archive, VOLUME_TIMEOUT)
                .await?;
            tracing::info!("restored volume {}", volume);
        }

        Ok(())
    }

    /// Engine tree restore. A bundle without the component is soft (the
    /// snapshot never captured it); a failing copy is fatal, because an
    /// engine restore without tenant or home data is not a valid
    /// migration.
    async fn restore_tree(
        &mut self,
        source: &Path,
        target: Option<PathBuf>,
        what: &str,
    ) -> Result<()> {
        let Some(target) = target else {
            return Ok(());
        };
        if !source.is_dir() {
            self.report
                .soft(format!("bundle contains no {} component", what));
            return Ok(());
        }

        copy_tree(source, &target, TREE_COPY_TIMEOUT)
            .await
            .with_context(|| format!("failed to restore {}", what))?;
        tracing::info!("restored {} into {}", what, target.display());
        Ok(())
    }
}

/// Find the bundle inside an extracted snapshot. The backup engine
/// reproduces the original staging path, so the bundle is usually nested a
/// few directories deep. A tree with neither a manifest nor the expected
/// layout is foreign or corrupted.
pub(crate) fn locate_bundle_root(root: &Path) -> Result<PathBuf> {
    let mut queue = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        if dir.join(MANIFEST_FILE).is_file() {
            return Ok(dir);
        }
        if dir.join(BUNDLE_DATABASES).is_dir() && dir.join(BUNDLE_CONFIG).is_dir() {
            return Ok(dir);
        }
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    queue.push_back(entry.path());
                }
            }
        }
    }

    bail!(
        "could not locate a backup bundle inside the restored snapshot at {}; \
         the snapshot looks foreign or corrupted",
        root.display()
    )
}

/// Env file inside the bundle's config directory: the primary name wins,
/// the legacy name is accepted when that is what the snapshot carries.
pub(crate) fn pick_env_source(config_dir: &Path) -> Option<(PathBuf, &'static str)> {
    let primary = config_dir.join(ENV_FILE);
    if primary.is_file() {
        return Some((primary, ENV_FILE));
    }
    let legacy = config_dir.join(ENV_FILE_LEGACY);
    if legacy.is_file() {
        return Some((legacy, ENV_FILE_LEGACY));
    }
    None
}

/// Dump file for a database, preferring the compressed form.
pub(crate) fn find_dump(dir: &Path, name: &str) -> Option<(PathBuf, bool)> {
    let gz = dir.join(format!("{}.sql.gz", name));
    if gz.is_file() {
        return Some((gz, true));
    }
    let plain = dir.join(format!("{}.sql", name));
    if plain.is_file() {
        return Some((plain, false));
    }
    None
}

pub(crate) fn volume_name_from_archive(archive: &Path) -> Option<String> {
    archive
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".tar.gz"))
        .map(|n| n.to_string())
}

pub(crate) fn parse_count(output: &str) -> Option<u64> {
    output.trim().lines().last()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_locate_bundle_root_nested() {
        let root = tempfile::tempdir().unwrap();
        let bundle = root
            .path()
            .join("var")
            .join("lib")
            .join("hostforge-backup-a1b2c3");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join(MANIFEST_FILE), "{}").unwrap();

        assert_eq!(locate_bundle_root(root.path()).unwrap(), bundle);
    }

    #[test]
    fn test_locate_bundle_root_by_layout_markers() {
        let root = tempfile::tempdir().unwrap();
        let bundle = root.path().join("staging");
        fs::create_dir_all(bundle.join(BUNDLE_DATABASES)).unwrap();
        fs::create_dir_all(bundle.join(BUNDLE_CONFIG)).unwrap();

        assert_eq!(locate_bundle_root(root.path()).unwrap(), bundle);
    }

    #[test]
    fn test_locate_bundle_root_rejects_foreign_trees() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("unrelated").join("stuff")).unwrap();

        assert!(locate_bundle_root(root.path()).is_err());
    }

    #[test]
    fn test_pick_env_source_prefers_primary() {
        let dir = tempfile::tempdir().unwrap();

        assert!(pick_env_source(dir.path()).is_none());

        fs::write(dir.path().join(ENV_FILE_LEGACY), "A=1").unwrap();
        let (_, name) = pick_env_source(dir.path()).unwrap();
        assert_eq!(name, ENV_FILE_LEGACY);

        fs::write(dir.path().join(ENV_FILE), "A=1").unwrap();
        let (_, name) = pick_env_source(dir.path()).unwrap();
        assert_eq!(name, ENV_FILE);
    }

    #[test]
    fn test_find_dump_prefers_compressed() {
        let dir = tempfile::tempdir().unwrap();

        assert!(find_dump(dir.path(), "users").is_none());

        fs::write(dir.path().join("users.sql"), "dump").unwrap();
        let (path, compressed) = find_dump(dir.path(), "users").unwrap();
        assert!(!compressed);
        assert!(path.ends_with("users.sql"));

        fs::write(dir.path().join("users.sql.gz"), "dump").unwrap();
        let (_, compressed) = find_dump(dir.path(), "users").unwrap();
        assert!(compressed);
    }

    #[test]
    fn test_volume_name_from_archive() {
        assert_eq!(
            volume_name_from_archive(Path::new("/x/hostforge_db_data.tar.gz")).as_deref(),
            Some("hostforge_db_data")
        );
        assert_eq!(volume_name_from_archive(Path::new("/x/notanarchive")), None);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("42\n"), Some(42));
        assert_eq!(parse_count("  7  "), Some(7));
        assert_eq!(parse_count("warning\n13"), Some(13));
        assert_eq!(parse_count("nope"), None);
    }
}
