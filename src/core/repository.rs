/// Backup repository integration
///
/// Typed surface over the restic CLI: init, backup, snapshot listing,
/// restore, forget. Repository credentials travel through the child
/// process environment, never through argv, so they cannot leak via
/// process listings. Only init and the connectivity check are retried;
/// data-bearing operations propagate failure immediately because a silent
/// retry could duplicate or corrupt data.

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::utils::constants::{
    CONNECT_BACKOFF, CONNECT_RETRIES, PRODUCT_TAG, REPO_FORGET_TIMEOUT, REPO_INIT_TIMEOUT,
    REPO_LIST_TIMEOUT, REPO_TRANSFER_TIMEOUT,
};
use crate::utils::helpers::run_with_timeout;
use crate::utils::settings::Settings;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("backup engine binary 'restic' not found on PATH; install restic and rerun")]
    BinaryMissing,

    #[error("repository unreachable after {retries} attempts: {message}")]
    Unreachable { retries: u32, message: String },
}

/// One snapshot as reported by `restic snapshots --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub short_id: String,
    pub time: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

pub struct RepositoryClient {
    repository: String,
    password: String,
    s3_access_key: Option<String>,
    s3_secret_key: Option<String>,
    cache_dir: std::path::PathBuf,
}

impl RepositoryClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let (repository, password) = settings.require_repository()?;
        Ok(Self {
            repository: repository.to_string(),
            password: password.to_string(),
            s3_access_key: settings.s3_access_key.clone(),
            s3_secret_key: settings.s3_secret_key.clone(),
            cache_dir: settings.cache_dir.clone(),
        })
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("restic");
        cmd.args(args);
        cmd.env("RESTIC_REPOSITORY", &self.repository);
        cmd.env("RESTIC_PASSWORD", &self.password);
        cmd.env("RESTIC_CACHE_DIR", &self.cache_dir);
        if let (Some(key), Some(secret)) = (&self.s3_access_key, &self.s3_secret_key) {
            cmd.env("AWS_ACCESS_KEY_ID", key);
            cmd.env("AWS_SECRET_ACCESS_KEY", secret);
        }
        cmd
    }

    pub async fn binary_available() -> bool {
        let mut cmd = Command::new("restic");
        cmd.arg("version");
        matches!(
            run_with_timeout("restic version", &mut cmd, Duration::from_secs(30)).await,
            Ok(output) if output.status.success()
        )
    }

    /// First-contact connectivity check, retried on transient failures.
    pub async fn check_connection(&self) -> Result<()> {
        if !Self::binary_available().await {
            return Err(RepositoryError::BinaryMissing.into());
        }

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_RETRIES {
            let mut cmd = self.command(&["cat", "config"]);
            match run_with_timeout("restic cat config", &mut cmd, REPO_LIST_TIMEOUT).await {
                Ok(output) if output.status.success() => return Ok(()),
                Ok(output) => {
                    last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
                }
                Err(e) => last_error = format!("{e:#}"),
            }

            if attempt < CONNECT_RETRIES {
                tracing::warn!(
                    "repository check failed (attempt {}/{}): {}",
                    attempt,
                    CONNECT_RETRIES,
                    last_error
                );
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }

        Err(RepositoryError::Unreachable {
            retries: CONNECT_RETRIES,
            message: last_error,
        }
        .into())
    }

    /// Idempotent repository creation: an already-initialized repository
    /// is success, not an error.
    pub async fn init(&self) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_RETRIES {
            let mut cmd = self.command(&["init"]);
            match run_with_timeout("restic init", &mut cmd, REPO_INIT_TIMEOUT).await {
                Ok(output) if output.status.success() => return Ok(()),
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if init_already_exists(&stderr) {
                        return Ok(());
                    }
                    last_error = stderr.trim().to_string();
                }
                Err(e) => last_error = format!("{e:#}"),
            }

            if attempt < CONNECT_RETRIES {
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }

        bail!("failed to initialize repository: {}", last_error)
    }

    /// Upload one bundle as a new tagged snapshot. Returns the new
    /// snapshot's short id when it can be extracted from the engine's
    /// output; an unparseable id after a successful upload is the caller's
    /// warning, not a failure — the snapshot exists either way.
    pub async fn backup(&self, path: &Path, tags: &[String]) -> Result<Option<String>> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["backup", path_str.as_str(), "--json"];
        for tag in tags {
            args.push("--tag");
            args.push(tag);
        }

        let mut cmd = self.command(&args);
        let output = run_with_timeout("restic backup", &mut cmd, REPO_TRANSFER_TIMEOUT).await?;
        if !output.status.success() {
            bail!(
                "repository upload failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(extract_snapshot_id(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn snapshots(&self, tag: Option<&str>) -> Result<Vec<SnapshotInfo>> {
        let mut args = vec!["snapshots", "--json"];
        if let Some(tag) = tag {
            args.push("--tag");
            args.push(tag);
        }

        let mut cmd = self.command(&args);
        let output = run_with_timeout("restic snapshots", &mut cmd, REPO_LIST_TIMEOUT).await?;
        if !output.status.success() {
            bail!(
                "failed to list snapshots: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        serde_json::from_slice(&output.stdout).context("failed to parse snapshot listing")
    }

    /// Download one snapshot into `target`. Never retried.
    pub async fn restore(&self, id: &str, target: &Path) -> Result<()> {
        let target_str = target.to_string_lossy().to_string();
        let mut cmd = self.command(&["restore", id, "--target", &target_str]);

        let output = run_with_timeout("restic restore", &mut cmd, REPO_TRANSFER_TIMEOUT).await?;
        if !output.status.success() {
            bail!(
                "failed to restore snapshot {}: {}",
                id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Prune snapshots under `tag` older than the retention window.
    pub async fn forget_older_than(&self, tag: &str, days: u32) -> Result<()> {
        let args = retention_args(tag, days);
        let args: Vec<&str> = args.iter().map(|a| a.as_str()).collect();
        let mut cmd = self.command(&args);

        let output = run_with_timeout("restic forget", &mut cmd, REPO_FORGET_TIMEOUT).await?;
        if !output.status.success() {
            bail!(
                "retention pruning failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Forget and prune one snapshot by id.
    pub async fn forget_snapshot(&self, id: &str) -> Result<()> {
        let mut cmd = self.command(&["forget", id, "--prune"]);

        let output = run_with_timeout("restic forget", &mut cmd, REPO_FORGET_TIMEOUT).await?;
        if !output.status.success() {
            bail!(
                "failed to delete snapshot {}: {}",
                id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Resolve a requested snapshot to a concrete id before anything
    /// destructive happens. "latest" walks host tag, then product tag,
    /// then the whole repository — the fallback chain that makes
    /// cross-host migration work, where the new host's tag does not exist
    /// yet.
    pub async fn resolve(&self, requested: &str, host_tag: &str) -> Result<String> {
        if requested != "latest" {
            let snaps = self.snapshots(None).await?;
            return find_snapshot(&snaps, requested)
                .map(|s| s.short_id.clone())
                .ok_or_else(|| {
                    anyhow!(
                        "snapshot {} not found in the repository; \
                         run 'hostforge-backup list-snapshots'",
                        requested
                    )
                });
        }

        for tag in [Some(host_tag), Some(PRODUCT_TAG), None] {
            let snaps = self.snapshots(tag).await?;
            if let Some(snap) = pick_latest(&snaps) {
                if tag != Some(host_tag) {
                    tracing::info!(
                        "no snapshot under tag {}; using {} from {}",
                        host_tag,
                        snap.short_id,
                        snap.hostname
                    );
                }
                return Ok(snap.short_id.clone());
            }
        }

        bail!("the repository contains no snapshots")
    }
}

/// Second and later `init` calls against the same repository report it as
/// existing; that is success, not an error.
pub(crate) fn init_already_exists(stderr: &str) -> bool {
    stderr.contains("already initialized") || stderr.contains("already exists")
}

/// Forget arguments for the retention pass: everything under the host tag
/// older than the day window goes, newer snapshots stay.
pub(crate) fn retention_args(tag: &str, days: u32) -> Vec<String> {
    vec![
        "forget".to_string(),
        "--tag".to_string(),
        tag.to_string(),
        "--keep-within".to_string(),
        format!("{}d", days),
        "--prune".to_string(),
    ]
}

/// Pull the new snapshot id out of `restic backup --json` output, falling
/// back to the plain-text "snapshot abc12345 saved" form.
pub(crate) fn extract_snapshot_id(stdout: &str) -> Option<String> {
    for line in stdout.lines().rev() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        if value.get("message_type").and_then(|m| m.as_str()) == Some("summary") {
            if let Some(id) = value.get("snapshot_id").and_then(|s| s.as_str()) {
                return Some(id.chars().take(8).collect());
            }
        }
    }

    let re = Regex::new(r"snapshot ([0-9a-f]{8,64}) saved").ok()?;
    re.captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().chars().take(8).collect())
}

/// Most recent snapshot in a listing.
pub(crate) fn pick_latest(snaps: &[SnapshotInfo]) -> Option<&SnapshotInfo> {
    snaps
        .iter()
        .max_by_key(|s| chrono::DateTime::parse_from_rfc3339(&s.time).ok())
}

/// Find a snapshot by short id or unique id prefix.
pub(crate) fn find_snapshot<'a>(snaps: &'a [SnapshotInfo], id: &str) -> Option<&'a SnapshotInfo> {
    snaps
        .iter()
        .find(|s| s.short_id == id || s.id.starts_with(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, time: &str, hostname: &str) -> SnapshotInfo {
        SnapshotInfo {
            id: format!("{}{}", id, "0".repeat(64 - id.len())),
            short_id: id.to_string(),
            time: time.to_string(),
            hostname: hostname.to_string(),
            tags: vec![],
            paths: vec![],
        }
    }

    #[test]
    fn test_extract_snapshot_id_from_json_summary() {
        let out = r#"{"message_type":"status","percent_done":1}
{"message_type":"summary","files_new":10,"snapshot_id":"251c2e5898f5ab3c2d3a"}"#;
        assert_eq!(extract_snapshot_id(out), Some("251c2e58".to_string()));
    }

    #[test]
    fn test_extract_snapshot_id_from_plain_output() {
        let out = "processed 120 files\nsnapshot 9a0bc8e112deadbeef saved\n";
        assert_eq!(extract_snapshot_id(out), Some("9a0bc8e1".to_string()));
    }

    #[test]
    fn test_extract_snapshot_id_missing() {
        assert_eq!(extract_snapshot_id("nothing useful here"), None);
        assert_eq!(extract_snapshot_id(""), None);
    }

    #[test]
    fn test_pick_latest_by_creation_time() {
        let snaps = vec![
            snap("aaaa1111", "2026-08-01T02:00:00Z", "host-a"),
            snap("bbbb2222", "2026-08-03T02:00:00Z", "host-a"),
            snap("cccc3333", "2026-08-02T02:00:00Z", "host-a"),
        ];
        assert_eq!(pick_latest(&snaps).unwrap().short_id, "bbbb2222");
        assert!(pick_latest(&[]).is_none());
    }

    #[test]
    fn test_init_already_exists_is_success() {
        assert!(init_already_exists(
            "Fatal: create repository at /srv/backups failed: config file already exists"
        ));
        assert!(init_already_exists("repository master key and config already initialized"));
        assert!(!init_already_exists("Fatal: wrong password or no key found"));
    }

    #[test]
    fn test_retention_args() {
        assert_eq!(
            retention_args("host-a", 7),
            vec!["forget", "--tag", "host-a", "--keep-within", "7d", "--prune"]
        );
    }

    #[test]
    fn test_find_snapshot_by_short_id_and_prefix() {
        let snaps = vec![
            snap("aaaa1111", "2026-08-01T02:00:00Z", "host-a"),
            snap("bbbb2222", "2026-08-02T02:00:00Z", "host-b"),
        ];
        assert_eq!(find_snapshot(&snaps, "bbbb2222").unwrap().hostname, "host-b");
        assert_eq!(find_snapshot(&snaps, "aaaa").unwrap().short_id, "aaaa1111");
        assert!(find_snapshot(&snaps, "ffff").is_none());
    }
}
