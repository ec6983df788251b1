use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;

mod client;
mod completion;
mod dispatch;
mod flows;
mod render;

#[cfg(test)]
mod tests;

#[derive(Parser, Debug)]
#[command(name = "reefup")]
#[command(about = "Lifecycle orchestrator for ReefDB clusters", long_about = None)]
struct Cli {
    /// Cluster topology and connection settings.
    #[arg(long, default_value = "cluster.toml")]
    config: PathBuf,
    /// Root of the local repository store.
    #[arg(long, default_value = "/opt/reef/repository")]
    repo_root: PathBuf,
    /// Where upgrade progress is checkpointed between invocations.
    #[arg(long, default_value = "reefup.checkpoint.json")]
    checkpoint: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the planned upgrade route without touching the cluster.
    Plan {
        component: String,
        /// Version the cluster is currently running.
        #[arg(long)]
        from: String,
        /// Version to upgrade to.
        #[arg(long)]
        to: String,
    },
    /// Run the upgrade stage by stage, resuming from the checkpoint.
    Upgrade {
        component: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Show the progress recorded in the checkpoint.
    Status,
    /// Generate shell completions.
    Completions { shell: Shell },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    dispatch::run_cli(cli)
}
