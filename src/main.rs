mod cli;
mod core;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::process::Stdio;

use crate::cli::{Cli, Commands};
use crate::core::lock::InstallLock;
use crate::core::repository::{find_snapshot, pick_latest};
use crate::core::restore::RestorePipeline;
use crate::core::snapshot::SnapshotPipeline;
use crate::core::{DeploymentProfile, RepositoryClient, RuntimeManager};
use crate::utils::helpers::{format_bytes, format_duration, hostname, mask_sensitive};
use crate::utils::Settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    let _log_guard = utils::logging::init(&settings.log_dir, cli.verbose);

    if let Err(e) = run(cli, settings).await {
        tracing::error!("{e:#}");
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Commands::Snapshot { background } => handle_snapshot(&settings, background).await,
        Commands::Restore { target, yes } => handle_restore(&settings, &target, yes).await,
        Commands::ListSnapshots => handle_list_snapshots(&settings).await,
        Commands::DeleteSnapshot { id, yes } => {
            handle_delete_snapshot(&settings, &id, yes).await
        }
        Commands::TestConnection => handle_test_connection(&settings).await,
        Commands::Status => handle_status(&settings).await,
    }
}

async fn handle_snapshot(settings: &Settings, background: bool) -> Result<()> {
    if background {
        return spawn_detached(settings);
    }

    let profile = DeploymentProfile::detect();
    println!(
        "Detected {} installation at {}",
        profile.variant.effective().as_str(),
        profile.install_root.display()
    );

    let _lock = InstallLock::acquire(&settings.staging_dir)?;
    install_signal_cleanup();

    let runtime = RuntimeManager::new(&profile)?;
    let repo = RepositoryClient::from_settings(settings)?;

    let mut pipeline = SnapshotPipeline::new(&profile, settings, &runtime, &repo);
    let outcome = pipeline.run().await?;

    println!();
    for failure in &outcome.soft_failures {
        println!("  {} {}", "!".yellow(), failure);
    }

    let verdict = if outcome.soft_failures.is_empty() {
        "✓ Snapshot completed".green().to_string()
    } else {
        format!(
            "⚠ Snapshot completed with {} errors",
            outcome.soft_failures.len()
        )
        .yellow()
        .to_string()
    };
    println!(
        "{} — {} in {}",
        verdict,
        format_bytes(outcome.bundle_bytes),
        format_duration(outcome.duration.as_secs())
    );
    if let Some(id) = outcome.snapshot_id {
        println!("Snapshot id: {}", id);
    }

    Ok(())
}

async fn handle_restore(settings: &Settings, target: &str, yes: bool) -> Result<()> {
    let profile = DeploymentProfile::detect();
    println!(
        "Detected {} installation at {}",
        profile.variant.effective().as_str(),
        profile.install_root.display()
    );

    let _lock = InstallLock::acquire(&settings.staging_dir)?;
    install_signal_cleanup();

    let runtime = RuntimeManager::new(&profile)?;
    let repo = RepositoryClient::from_settings(settings)?;

    let mut pipeline = RestorePipeline::new(&profile, settings, &runtime, &repo);
    let outcome = pipeline.run(target, yes).await?;

    println!();
    for failure in &outcome.soft_failures {
        println!("  {} {}", "!".yellow(), failure);
    }

    let verdict = if outcome.soft_failures.is_empty() {
        format!("✓ Restore of {} completed", outcome.snapshot_id)
            .green()
            .to_string()
    } else {
        format!(
            "⚠ Restore of {} completed with {} errors",
            outcome.snapshot_id,
            outcome.soft_failures.len()
        )
        .yellow()
        .to_string()
    };
    println!(
        "{} in {}",
        verdict,
        format_duration(outcome.duration.as_secs())
    );
    println!("Check service state with: hostforge-backup status");

    Ok(())
}

async fn handle_list_snapshots(settings: &Settings) -> Result<()> {
    let repo = RepositoryClient::from_settings(settings)?;
    let host = hostname();

    let mut snapshots = repo.snapshots(Some(&host)).await?;
    let scope = if snapshots.is_empty() {
        snapshots = repo.snapshots(None).await?;
        "all hosts"
    } else {
        "this host"
    };

    if snapshots.is_empty() {
        println!("No snapshots in the repository yet.");
        println!("Create one with: hostforge-backup snapshot");
        return Ok(());
    }

    println!("Snapshots ({})\n", scope);
    println!("{:<10} {:<20} {:<16} {}", "ID", "Created", "Host", "Tags");
    println!("{}", "-".repeat(72));
    for snap in &snapshots {
        let created = snap
            .time
            .split('.')
            .next()
            .unwrap_or(&snap.time)
            .replace('T', " ");
        println!(
            "{:<10} {:<20} {:<16} {}",
            snap.short_id,
            created,
            snap.hostname,
            snap.tags.join(",")
        );
    }
    println!("\nTotal: {} snapshots", snapshots.len());

    Ok(())
}

async fn handle_delete_snapshot(settings: &Settings, id: &str, yes: bool) -> Result<()> {
    let repo = RepositoryClient::from_settings(settings)?;

    let snapshots = repo.snapshots(None).await?;
    let snapshot = find_snapshot(&snapshots, id)
        .with_context(|| format!("snapshot {} not found in the repository", id))?;

    println!(
        "Snapshot {} from {} created {}",
        snapshot.short_id, snapshot.hostname, snapshot.time
    );

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt("Permanently delete this snapshot?")
            .default(false)
            .interact()
            .context("could not read confirmation; rerun with --yes for unattended use")?;
        if !confirmed {
            println!("Delete cancelled.");
            return Ok(());
        }
    }

    let short_id = snapshot.short_id.clone();
    repo.forget_snapshot(&short_id).await?;
    println!("{} Snapshot {} deleted", "✓".green(), short_id);

    Ok(())
}

async fn handle_test_connection(settings: &Settings) -> Result<()> {
    println!("Checking backup engine...");
    if RepositoryClient::binary_available().await {
        println!("  {} restic binary found", "✓".green());
    } else {
        println!("  {} restic binary not found on PATH", "✗".red());
        anyhow::bail!("install restic and rerun 'hostforge-backup test-connection'");
    }

    println!("Checking container runtime...");
    let profile = DeploymentProfile::detect();
    let daemon_ok = match RuntimeManager::new(&profile) {
        Ok(runtime) => runtime.ping().await,
        Err(_) => false,
    };
    if daemon_ok {
        println!("  {} Docker daemon reachable", "✓".green());
    } else {
        println!(
            "  {} Docker daemon not reachable (snapshots will fail)",
            "✗".red()
        );
    }

    println!("Checking repository...");
    let repo = RepositoryClient::from_settings(settings)?;
    repo.check_connection().await?;
    println!("  {} repository reachable and unlocked", "✓".green());

    Ok(())
}

async fn handle_status(settings: &Settings) -> Result<()> {
    let profile = DeploymentProfile::detect();

    println!(
        "hostforge-backup {} (built {})\n",
        env!("CARGO_PKG_VERSION"),
        cli::BUILD_TIMESTAMP
    );
    println!("Hostforge installation\n");
    println!("  Variant:      {}", profile.variant.as_str());
    println!("  Install root: {}", profile.install_root.display());
    println!(
        "  Env file:     {} ({})",
        profile.env_file.display(),
        if profile.env_file.exists() {
            "present"
        } else {
            "missing"
        }
    );
    println!(
        "  Databases:    {}",
        profile
            .databases
            .iter()
            .map(|d| d.name)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Volumes:      {}", profile.volumes.join(", "));

    println!("\nBackup repository\n");
    match settings.repository.as_deref() {
        Some(repo) => println!("  Repository:   {}", mask_sensitive(repo, 12)),
        None => {
            println!("  Repository:   not configured");
            println!("\nConfigure it in {}", Settings::config_path().display());
            return Ok(());
        }
    }
    println!("  Retention:    {} days", settings.retention_days);

    let repo = RepositoryClient::from_settings(settings)?;
    match repo.snapshots(Some(&hostname())).await {
        Ok(snapshots) => {
            println!("  Snapshots:    {} under this host's tag", snapshots.len());
            if let Some(latest) = pick_latest(&snapshots) {
                println!("  Most recent:  {} ({})", latest.short_id, latest.time);
            }
        }
        Err(e) => println!("  Snapshots:    unavailable ({e:#})"),
    }

    Ok(())
}

/// Re-exec ourselves detached from the terminal's process group, with
/// output going to the log directory. The child runs the synchronous
/// snapshot path.
fn spawn_detached(settings: &Settings) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    std::fs::create_dir_all(&settings.log_dir).ok();
    let log_path = settings.log_dir.join("snapshot-background.log");
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let child = std::process::Command::new(exe)
        .arg("snapshot")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()
        .context("failed to spawn background snapshot")?;

    println!(
        "Snapshot running in background (pid {}); output in {}",
        child.id(),
        log_path.display()
    );
    Ok(())
}

/// SIGINT/SIGTERM must still remove staging directories: they hold
/// unencrypted dumps and may never be left behind.
fn install_signal_cleanup() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut term) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut int) = signal(SignalKind::interrupt()) else {
            return;
        };

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }

        tracing::warn!("interrupted; removing staging directories");
        crate::core::staging::cleanup_registered();
        std::process::exit(130);
    });
}
