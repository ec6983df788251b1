use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reefup_core::{
    CheckpointStore, ClusterConfig, FileCheckpointStore, RepositoryStore, RouteNode,
    UpgradeCheckpoint,
};
use reefup_route::{next_stage_index, plan_route, verify_resumed_route};
use reefup_upgrade::{run_preflight_checks, StageOutcome, UpgradeMachine, VersionFamily};
use semver::Version;

use crate::client::{BatchSqlConnector, CtlServiceControl, SshRemoteSession};
use crate::render;

pub fn load_cluster(path: &Path) -> Result<ClusterConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster config: {}", path.display()))?;
    ClusterConfig::from_toml_str(&raw)
        .with_context(|| format!("invalid cluster config: {}", path.display()))
}

pub fn parse_version(raw: &str) -> Result<Version> {
    Version::parse(raw).with_context(|| format!("invalid version: {raw}"))
}

pub fn plan(
    store: &RepositoryStore,
    component: &str,
    from: &str,
    to: &str,
) -> Result<Vec<RouteNode>> {
    let chain = store.upgrade_chain(component, &parse_version(from)?, &parse_version(to)?)?;
    plan_route(&chain)
}

/// Binary-level stages left to run from the given route position.
pub fn remaining_stages(route: &[RouteNode], mut route_index: usize) -> usize {
    let mut stages = 0;
    while route_index < route.len() {
        let stage = next_stage_index(route, route_index);
        stages += 1;
        route_index = stage + 1;
    }
    stages
}

pub fn format_route_lines(component: &str, route: &[RouteNode]) -> Vec<String> {
    let mut lines = vec![format!(
        "Upgrade route for {component}: {} transition(s), {} stage(s)",
        route.len() - 1,
        remaining_stages(route, 1)
    )];
    for (index, node) in route.iter().enumerate() {
        let marker = if index == 0 {
            "running"
        } else if node.require_from_binary {
            "binary swap"
        } else if node.direct_upgrade {
            "direct scripts"
        } else {
            "scripts only"
        };
        lines.push(format!("- {} ({marker})", node.repository.version));
    }
    lines
}

pub fn format_status_lines(checkpoint: &UpgradeCheckpoint) -> Vec<String> {
    let current = &checkpoint.route[checkpoint.route_index - 1].repository.version;
    let target = &checkpoint.route[checkpoint.route.len() - 1].repository.version;

    let mut lines = vec![
        format!("Component: {}", checkpoint.component),
        format!("Running:   {current}"),
        format!("Target:    {target}"),
    ];
    if checkpoint.is_complete() {
        lines.push("Progress:  complete".to_string());
        return lines;
    }

    let stage = next_stage_index(&checkpoint.route, checkpoint.route_index);
    let destination = &checkpoint.route[stage].repository.version;
    let pipeline = VersionFamily::of(destination).pipeline();
    let step = pipeline
        .get(checkpoint.process_index)
        .map(|step| step.name())
        .unwrap_or("stage wrap-up");
    lines.push(format!(
        "Progress:  stage -> {destination}, step {}/{} ({step})",
        checkpoint.process_index + 1,
        pipeline.len()
    ));
    lines
}

pub fn run_upgrade(
    cluster: &ClusterConfig,
    component: &str,
    route: Vec<RouteNode>,
    checkpoint_path: &Path,
) -> Result<()> {
    let report = run_preflight_checks(cluster, &route);
    if !report.is_ok() {
        for failure in report.failures() {
            render::print_status("failed", failure);
        }
        return Err(anyhow!(
            "{} preflight check(s) failed",
            report.failures().len()
        ));
    }

    let store = FileCheckpointStore::new(checkpoint_path);
    let checkpoint = match store.load()? {
        Some(existing) => {
            if existing.component != component {
                return Err(anyhow!(
                    "checkpoint belongs to component '{}', not '{component}'",
                    existing.component
                ));
            }
            verify_resumed_route(&route, &existing)?;
            render::print_status(
                "resume",
                &format!(
                    "continuing a previous run at route position {}",
                    existing.route_index
                ),
            );
            existing
        }
        None => UpgradeCheckpoint::new(component, route),
    };

    let total = remaining_stages(&checkpoint.route, checkpoint.route_index);
    let bar = render::stage_progress(total as u64);

    let mut remote = SshRemoteSession::new();
    let mut control = CtlServiceControl::new();
    let mut connector = BatchSqlConnector::for_cluster(cluster);
    let mut machine = UpgradeMachine::new(
        cluster,
        checkpoint,
        &store,
        &mut remote,
        &mut control,
        &mut connector,
    );

    loop {
        match machine.run_stage() {
            Ok(StageOutcome::StageComplete) => {
                bar.inc(1);
                render::print_status("stage", "stage complete, continuing");
            }
            Ok(StageOutcome::UpgradeComplete) => {
                bar.inc(1);
                bar.finish_and_clear();
                store.clear()?;
                render::print_status("done", "cluster is on the target version");
                return Ok(());
            }
            Err(err) => {
                bar.abandon();
                render::print_status(
                    "failed",
                    "upgrade aborted; the checkpoint is kept for resumption",
                );
                return Err(err);
            }
        }
    }
}
