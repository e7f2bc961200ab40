/// Container runtime integration
///
/// Typed surface over the Docker daemon and the compose CLI for one
/// installation. Container/volume queries go through the daemon API;
/// compose orchestration, in-container exec and helper containers go
/// through the docker CLI. Every exec carries an explicit timeout: a hung
/// database client inside a container must not hang the orchestrator.

use anyhow::{anyhow, bail, Context, Result};
use bollard::container::ListContainersOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::core::deployment::DeploymentProfile;
use crate::utils::constants::{COMPOSE_TIMEOUT, HELPER_IMAGE};
use crate::utils::helpers::run_with_timeout;

/// Captured result of an in-container or helper-container command.
#[derive(Debug)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ComposePsEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Service", default)]
    pub service: Option<String>,
    #[serde(rename = "State")]
    pub state: String,
}

pub struct RuntimeManager {
    docker: Docker,
    install_root: PathBuf,
    compose_file: PathBuf,
    project: String,
}

impl RuntimeManager {
    pub fn new(profile: &DeploymentProfile) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        Ok(Self {
            docker,
            install_root: profile.install_root.clone(),
            compose_file: profile.compose_file(),
            project: profile.compose_project(),
        })
    }

    /// Check if the Docker daemon is accessible
    pub async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Id of the running container backing a compose service, if any.
    pub async fn service_container_id(&self, service: &str) -> Result<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("com.docker.compose.project={}", self.project),
                format!("com.docker.compose.service={}", service),
            ],
        );
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;

        Ok(containers.into_iter().find_map(|c| c.id))
    }

    /// Read one variable from a running container's environment.
    pub async fn container_env(&self, container: &str, key: &str) -> Result<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(container, None)
            .await
            .with_context(|| format!("failed to inspect container {}", container))?;

        let prefix = format!("{}=", key);
        Ok(inspect
            .config
            .and_then(|c| c.env)
            .and_then(|env| {
                env.into_iter()
                    .find(|e| e.starts_with(&prefix))
                    .map(|e| e[prefix.len()..].to_string())
            }))
    }

    /// Build a `docker exec` invocation. Environment pairs are set on the
    /// docker process and forwarded with bare `-e KEY`, so values (database
    /// passwords) never appear in any argv.
    fn exec_cmd(
        &self,
        container: &str,
        script: &str,
        env: &[(&str, &str)],
        interactive: bool,
    ) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        if interactive {
            cmd.arg("-i");
        }
        for (key, value) in env.iter().copied() {
            cmd.env(key, value);
            cmd.arg("-e").arg(key);
        }
        cmd.arg(container).args(["sh", "-c", script]);
        cmd
    }

    /// Run a shell script inside a container.
    pub async fn exec_sh(
        &self,
        container: &str,
        script: &str,
        env: &[(&str, &str)],
        limit: Duration,
    ) -> Result<ExecOutput> {
        let mut cmd = self.exec_cmd(container, script, env, false);
        let output = run_with_timeout("docker exec", &mut cmd, limit).await?;
        Ok(ExecOutput::from_output(output))
    }

    /// Run a shell script inside a container, streaming its stdout into a
    /// local file. Used for database dumps, which can be far larger than
    /// anything we want to buffer.
    pub async fn exec_sh_to_file(
        &self,
        container: &str,
        script: &str,
        env: &[(&str, &str)],
        outfile: &Path,
        limit: Duration,
    ) -> Result<ExecOutput> {
        let file = std::fs::File::create(outfile)
            .with_context(|| format!("failed to create {}", outfile.display()))?;

        let mut cmd = self.exec_cmd(container, script, env, false);
        cmd.stdout(Stdio::from(file));

        let output = run_with_timeout("docker exec", &mut cmd, limit).await?;
        Ok(ExecOutput::from_output(output))
    }

    /// Run a shell script inside a container with a local file as stdin.
    /// Used for streamed database imports.
    pub async fn exec_sh_from_file(
        &self,
        container: &str,
        script: &str,
        env: &[(&str, &str)],
        infile: &Path,
        limit: Duration,
    ) -> Result<ExecOutput> {
        let file = std::fs::File::open(infile)
            .with_context(|| format!("failed to open {}", infile.display()))?;

        let mut cmd = self.exec_cmd(container, script, env, true);
        cmd.stdin(Stdio::from(file));

        let output = run_with_timeout("docker exec", &mut cmd, limit).await?;
        Ok(ExecOutput::from_output(output))
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(anyhow!("failed to inspect volume {}: {}", name, e)),
        }
    }

    pub async fn create_volume(&self, name: &str) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to create volume {}", name))?;
        Ok(())
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .with_context(|| format!("failed to remove volume {}", name))?;
        Ok(())
    }

    /// Archive a volume's contents into `<dest_dir>/<volume>.tar.gz` via a
    /// short-lived helper container mounting the volume read-only. The
    /// caller judges success by the produced file, not by the exit code:
    /// tar reports a warning exit when live files mutate mid-archive.
    pub async fn archive_volume(
        &self,
        volume: &str,
        dest_dir: &Path,
        limit: Duration,
    ) -> Result<ExecOutput> {
        let mut cmd = Command::new("docker");
        cmd.args([
            "run",
            "--rm",
            "-v",
            &format!("{}:/source:ro", volume),
            "-v",
            &format!("{}:/backup", dest_dir.display()),
            HELPER_IMAGE,
            "tar",
            "czf",
            &format!("/backup/{}.tar.gz", volume),
            "-C",
            "/source",
            ".",
        ]);

        let output = run_with_timeout("volume archive", &mut cmd, limit).await?;
        Ok(ExecOutput::from_output(output))
    }

    /// Repopulate a volume from an archive produced by `archive_volume`.
    pub async fn extract_volume(
        &self,
        volume: &str,
        archive: &Path,
        limit: Duration,
    ) -> Result<()> {
        let dir = archive
            .parent()
            .ok_or_else(|| anyhow!("archive {} has no parent directory", archive.display()))?;
        let file = archive
            .file_name()
            .ok_or_else(|| anyhow!("archive {} has no file name", archive.display()))?
            .to_string_lossy()
            .to_string();

        let mut cmd = Command::new("docker");
        cmd.args([
            "run",
            "--rm",
            "-v",
            &format!("{}:/target", volume),
            "-v",
            &format!("{}:/backup:ro", dir.display()),
            HELPER_IMAGE,
            "tar",
            "xzf",
            &format!("/backup/{}", file),
            "-C",
            "/target",
        ]);

        let output = run_with_timeout("volume extract", &mut cmd, limit).await?;
        if !output.status.success() {
            bail!(
                "extracting {} into volume {} failed: {}",
                archive.display(),
                volume,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Execute a docker compose command for this installation.
    pub async fn compose_command(&self, args: &[&str], limit: Duration) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .args(["-f", &self.compose_file.to_string_lossy()])
            .args(args)
            .current_dir(&self.install_root);

        let output = run_with_timeout("docker compose", &mut cmd, limit).await?;
        if !output.status.success() {
            bail!(
                "docker compose {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Start specific services (or everything when empty).
    pub async fn compose_up(&self, services: &[&str]) -> Result<()> {
        let mut args = vec!["up", "-d"];
        args.extend_from_slice(services);
        self.compose_command(&args, COMPOSE_TIMEOUT).await?;
        Ok(())
    }

    /// Stop and remove all services, keeping volumes.
    pub async fn compose_down(&self) -> Result<()> {
        self.compose_command(&["down"], COMPOSE_TIMEOUT).await?;
        Ok(())
    }

    pub async fn compose_stop(&self, services: &[&str]) -> Result<()> {
        let mut args = vec!["stop"];
        args.extend_from_slice(services);
        self.compose_command(&args, COMPOSE_TIMEOUT).await?;
        Ok(())
    }

    /// Names of services currently reporting a running state.
    pub async fn compose_running_services(&self) -> Result<Vec<String>> {
        let stdout = self
            .compose_command(&["ps", "--format", "json"], COMPOSE_TIMEOUT)
            .await?;
        Ok(parse_compose_ps(&stdout)
            .into_iter()
            .filter(|e| e.state.eq_ignore_ascii_case("running"))
            .map(|e| e.service.unwrap_or(e.name))
            .collect())
    }

    /// Services defined in the compose file.
    pub fn compose_services(&self) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(&self.compose_file)
            .with_context(|| format!("failed to read {}", self.compose_file.display()))?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.compose_file.display()))?;

        Ok(yaml
            .get("services")
            .and_then(|s| s.as_mapping())
            .map(|services| {
                services
                    .keys()
                    .filter_map(|k| k.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Best-effort size estimate for a set of volumes, from
    /// `docker system df -v`. Used only for the preflight free-space check.
    pub async fn volume_size_estimate(&self, volumes: &[String]) -> u64 {
        let mut cmd = Command::new("docker");
        cmd.args(["system", "df", "-v"]);

        let output = match run_with_timeout("docker system df", &mut cmd, COMPOSE_TIMEOUT).await
        {
            Ok(output) if output.status.success() => output,
            _ => return 0,
        };

        let sizes = parse_volume_sizes(&String::from_utf8_lossy(&output.stdout));
        volumes.iter().filter_map(|v| sizes.get(v)).sum()
    }
}

/// Parse Docker size string to bytes (e.g. "408MB", "6.15kB", "1.5GB")
pub(crate) fn parse_size_string(size_str: &str) -> u64 {
    let size_str = size_str.trim();

    let mut num_str = String::new();
    let mut unit_str = String::new();

    for ch in size_str.chars() {
        if ch.is_numeric() || ch == '.' {
            num_str.push(ch);
        } else if ch.is_alphabetic() {
            unit_str.push(ch);
        }
    }

    let num: f64 = num_str.parse().unwrap_or(0.0);
    let unit = unit_str.to_uppercase();

    let multiplier: u64 = match unit.as_str() {
        "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        "TB" => 1024 * 1024 * 1024 * 1024,
        _ => 1,
    };

    (num * multiplier as f64) as u64
}

/// Parse the VOLUME NAME section of `docker system df -v`.
pub(crate) fn parse_volume_sizes(output: &str) -> HashMap<String, u64> {
    let mut volume_sizes = HashMap::new();
    let mut in_volumes_section = false;

    for line in output.lines() {
        if line.contains("VOLUME NAME") {
            in_volumes_section = true;
            continue;
        }

        if in_volumes_section {
            if line.is_empty() || line.starts_with("Build cache") {
                break;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                volume_sizes.insert(parts[0].to_string(), parse_size_string(parts[2]));
            }
        }
    }

    volume_sizes
}

/// Parse `docker compose ps --format json`, which emits one JSON object
/// per line on current compose releases and a JSON array on older ones.
pub(crate) fn parse_compose_ps(stdout: &str) -> Vec<ComposePsEntry> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).unwrap_or_default();
    }

    trimmed
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_string() {
        assert_eq!(parse_size_string("408MB"), 408 * 1024 * 1024);
        assert_eq!(parse_size_string("1.5GB"), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert_eq!(parse_size_string("0B"), 0);
        assert_eq!(parse_size_string("garbage"), 0);
    }

    #[test]
    fn test_parse_volume_sizes() {
        let df = "\
Images space usage:

REPOSITORY   TAG   IMAGE ID   CREATED   SIZE   SHARED SIZE   UNIQUE SIZE   CONTAINERS

VOLUME NAME                LINKS     SIZE
hostforge_db_data          1         7.066GB
hostforge_redis_data       1         12.5MB

Build cache usage: 0B
";
        let sizes = parse_volume_sizes(df);
        assert_eq!(sizes.len(), 2);
        assert_eq!(
            sizes["hostforge_db_data"],
            (7.066 * 1024.0 * 1024.0 * 1024.0) as u64
        );
        assert!(sizes.contains_key("hostforge_redis_data"));
    }

    #[test]
    fn test_parse_compose_ps_ndjson() {
        let out = r#"{"Name":"hostforge-db-1","Service":"db","State":"running"}
{"Name":"hostforge-redis-1","Service":"redis","State":"exited"}"#;

        let entries = parse_compose_ps(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].service.as_deref(), Some("db"));
        assert_eq!(entries[0].state, "running");
    }

    #[test]
    fn test_parse_compose_ps_array_and_empty() {
        let out = r#"[{"Name":"hostforge-db-1","Service":"db","State":"running"}]"#;
        assert_eq!(parse_compose_ps(out).len(), 1);
        assert!(parse_compose_ps("").is_empty());
    }
}
