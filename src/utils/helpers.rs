/// Helper utilities shared by the pipelines and adapters

use anyhow::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Exit codes rsync uses for partial transfers of a live tree; the copy is
/// still usable.
const RSYNC_PARTIAL_CODES: &[i32] = &[23, 24];

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    if value.len() <= visible_chars * 2 {
        "*".repeat(value.len())
    } else {
        let start = &value[..visible_chars];
        let end = &value[value.len() - visible_chars..];
        format!("{}...{}", start, end)
    }
}

/// Generate a random alphanumeric suffix for staging directory names.
/// thread_rng is a CSPRNG, which matters here: the suffix doubles as a
/// guard against predictable temp paths.
pub fn random_suffix(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Hostname of the machine we are running on.
pub fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Primary IPv4 address of this host, used to rewrite stored server
/// identity after a migration restore.
pub fn local_ip() -> String {
    if let Ok(output) = std::process::Command::new("hostname").arg("-I").output() {
        if output.status.success() {
            if let Some(ip) = String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .next()
            {
                return ip.to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

/// Run a subprocess with an explicit timeout, killing it when the budget is
/// exhausted. Every external invocation goes through here; a hung child must
/// not hang the orchestrator.
pub async fn run_with_timeout(
    label: &str,
    cmd: &mut Command,
    limit: Duration,
) -> Result<Output> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(result) => result.with_context(|| format!("failed to run {}", label)),
        Err(_) => bail!(
            "{} timed out after {}",
            label,
            humantime::format_duration(limit)
        ),
    }
}

/// Stream-copy a directory tree, preferring rsync and falling back to a
/// plain recursive cp when rsync is unavailable or fails hard. rsync's
/// partial-transfer exits (source files mutating mid-copy) count as success.
pub async fn copy_tree(src: &Path, dst: &Path, limit: Duration) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;

    let src_arg = format!("{}/", src.display());
    let dst_arg = format!("{}/", dst.display());

    let mut rsync = Command::new("rsync");
    rsync.arg("-a").arg(&src_arg).arg(&dst_arg);

    match run_with_timeout("rsync", &mut rsync, limit).await {
        Ok(output) => {
            let code = output.status.code();
            if output.status.success() || code.is_some_and(|c| RSYNC_PARTIAL_CODES.contains(&c)) {
                return Ok(());
            }
            tracing::warn!(
                "rsync of {} exited with {:?}, falling back to cp",
                src.display(),
                code
            );
        }
        Err(e) => {
            tracing::warn!("rsync unavailable ({e:#}), falling back to cp");
        }
    }

    let mut cp = Command::new("cp");
    cp.arg("-a").arg(&src_arg).arg(dst);
    let output = run_with_timeout("cp", &mut cp, limit).await?;
    if !output.status.success() {
        bail!(
            "copy of {} failed: {}",
            src.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Recursively copy a directory, skipping any entry whose file name matches
/// one of `exclude`. Symlinks are recreated, not followed.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<u64> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;

    let mut copied = 0u64;
    for entry in std::fs::read_dir(src)
        .with_context(|| format!("failed to read {}", src.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if exclude.iter().any(|e| name == std::ffi::OsStr::new(e)) {
            continue;
        }

        let target = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else if file_type.is_dir() {
            copied += copy_dir_filtered(&entry.path(), &target, exclude)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3661), "1h 1m");
        assert_eq!(format_duration(86400), "1d 0h");
    }

    #[test]
    fn test_mask_sensitive() {
        let token = "5e7f294e4c92a9aa661fae8d347d832d";
        let masked = mask_sensitive(token, 4);
        assert_eq!(masked, "5e7f...832d");
        assert_eq!(mask_sensitive("short", 4), "*****");
    }

    #[test]
    fn test_random_suffix() {
        let a = random_suffix(12);
        let b = random_suffix(12);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_copy_dir_filtered() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        std::fs::write(src.path().join("keep.txt"), "data").unwrap();
        std::fs::create_dir(src.path().join(".git")).unwrap();
        std::fs::write(src.path().join(".git").join("HEAD"), "ref").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub").join("nested.txt"), "x").unwrap();

        let copied =
            copy_dir_filtered(src.path(), dst.path(), &[".git", "node_modules"]).unwrap();

        assert_eq!(copied, 2);
        assert!(dst.path().join("keep.txt").exists());
        assert!(dst.path().join("sub").join("nested.txt").exists());
        assert!(!dst.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_run_with_timeout_kills_slow_commands() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_with_timeout("sleep", &mut cmd, Duration::from_millis(100)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_with_timeout_captures_output() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let output = run_with_timeout("echo", &mut cmd, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
