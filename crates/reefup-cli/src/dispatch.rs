use anyhow::Result;
use reefup_core::{CheckpointStore, FileCheckpointStore, RepositoryStore};

use crate::{completion, flows, render, Cli, Commands};

pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Plan {
            component,
            from,
            to,
        } => {
            let store = RepositoryStore::open(&cli.repo_root);
            let route = flows::plan(&store, &component, &from, &to)?;
            for line in flows::format_route_lines(&component, &route) {
                println!("{line}");
            }
        }
        Commands::Upgrade {
            component,
            from,
            to,
        } => {
            let cluster = flows::load_cluster(&cli.config)?;
            let store = RepositoryStore::open(&cli.repo_root);
            let route = flows::plan(&store, &component, &from, &to)?;
            render::print_status(
                "upgrade",
                &format!("{component} {from} -> {to} on cluster '{}'", cluster.name),
            );
            flows::run_upgrade(&cluster, &component, route, &cli.checkpoint)?;
        }
        Commands::Status => {
            let store = FileCheckpointStore::new(&cli.checkpoint);
            match store.load()? {
                Some(checkpoint) => {
                    for line in flows::format_status_lines(&checkpoint) {
                        println!("{line}");
                    }
                }
                None => println!("No upgrade in progress."),
            }
        }
        Commands::Completions { shell } => completion::write_completions(shell),
    }
    Ok(())
}
