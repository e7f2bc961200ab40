/// CLI argument parsing

use clap::{Parser, Subcommand};

// Build timestamp injected at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const VERSION_WITH_BUILD: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built: ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

#[derive(Parser)]
#[command(name = "hostforge-backup")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a snapshot of the local installation
    Snapshot {
        /// Run detached, surviving terminal disconnection
        #[arg(long)]
        background: bool,
    },

    /// Restore a snapshot over the local installation
    Restore {
        /// Snapshot id, or "latest"
        target: String,

        /// Skip the interactive confirmation gate
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List snapshots stored in the repository
    ListSnapshots,

    /// Delete one snapshot from the repository
    DeleteSnapshot {
        /// Snapshot id
        id: String,

        /// Skip the interactive confirmation gate
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Verify repository and container runtime connectivity
    TestConnection,

    /// Show deployment and repository status
    Status,
}
