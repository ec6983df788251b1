//! Zone-partitioned binary swap: rolling and non-rolling strategies.
//!
//! Servers are grouped by zone from the current cluster config on every
//! attempt; the grouping is never cached because topology can change
//! between resumed runs. With more than two zones the swap proceeds zone by
//! zone behind consistency gates; with one or two zones a deliberately
//! stopped zone would cost the replication majority, so everything swaps at
//! once instead.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use reefup_core::{ClusterConfig, RouteNode, ServerConfig, SoftwareRepository};
use tracing::info;

use crate::gates::{self, GateConfig};
use crate::pipeline::HEALTH_CHECKER_SCRIPT;
use crate::scripts::{ConnectParams, ScriptExecutor};
use crate::session::{DbSession, RemoteSession, ServiceControl};
use crate::{params, scripts};

/// Servers grouped by zone, in zone-name order.
pub fn zone_groups(cluster: &ClusterConfig) -> BTreeMap<String, Vec<ServerConfig>> {
    let mut groups: BTreeMap<String, Vec<ServerConfig>> = BTreeMap::new();
    for server in &cluster.servers {
        groups.entry(server.zone.clone()).or_default().push(server.clone());
    }
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollMode {
    Rolling,
    NonRolling,
}

impl RollMode {
    /// Fewer than three zones cannot lose a zone's replicas and keep
    /// majority availability, so they take the all-at-once path.
    pub fn select(zone_count: usize) -> Self {
        if zone_count > 2 {
            Self::Rolling
        } else {
            Self::NonRolling
        }
    }
}

/// Executes the binary-swap step for one stage. Failures surface to the
/// state machine unchanged; zones already swapped stay swapped.
#[allow(clippy::too_many_arguments)]
pub fn roll_zones(
    cluster: &ClusterConfig,
    db: &mut dyn DbSession,
    remote: &mut dyn RemoteSession,
    control: &mut dyn ServiceControl,
    executor: &mut ScriptExecutor,
    gate: &GateConfig,
    destination: &RouteNode,
    per_zone_health_check: bool,
) -> Result<()> {
    let groups = zone_groups(cluster);
    match RollMode::select(groups.len()) {
        RollMode::NonRolling => {
            roll_all_at_once(cluster, db, remote, control, gate, &destination.repository)
        }
        RollMode::Rolling => roll_zone_by_zone(
            cluster,
            db,
            remote,
            control,
            executor,
            gate,
            destination,
            &groups,
            per_zone_health_check,
        ),
    }
}

fn roll_all_at_once(
    cluster: &ClusterConfig,
    db: &mut dyn DbSession,
    remote: &mut dyn RemoteSession,
    control: &mut dyn ServiceControl,
    gate: &GateConfig,
    repository: &SoftwareRepository,
) -> Result<()> {
    info!(version = %repository.version, "swapping all zones at once");
    for server in &cluster.servers {
        swap_server_binaries(remote, server, repository)?;
    }
    control.stop_servers(&cluster.servers)?;
    params::push_configured_parameters(remote, cluster)?;
    control.start_servers(&cluster.servers, false)?;
    gates::wait_cluster_healthy(db, gate)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn roll_zone_by_zone(
    cluster: &ClusterConfig,
    db: &mut dyn DbSession,
    remote: &mut dyn RemoteSession,
    control: &mut dyn ServiceControl,
    executor: &mut ScriptExecutor,
    gate: &GateConfig,
    destination: &RouteNode,
    groups: &BTreeMap<String, Vec<ServerConfig>>,
    per_zone_health_check: bool,
) -> Result<()> {
    let repository = &destination.repository;
    let mut previous: Option<&str> = None;

    for (zone, servers) in groups {
        // Bring the previous zone fully back before touching this one; at
        // no point are two zones down together.
        if let Some(done) = previous.take() {
            gates::wait_zone_started(db, gate, done)?;
        }

        info!(zone = %zone, version = %repository.version, "rolling zone");
        gates::wait_schema_refreshed(db, gate, zone)?;
        gates::wait_no_replication_backlog(db, gate, zone)?;

        db.execute(&format!("ALTER SYSTEM STOP ZONE '{zone}'"), &[])
            .with_context(|| format!("failed to stop zone {zone}"))?;
        gates::wait_zone_inactive(db, gate, zone)?;

        for server in servers {
            swap_server_binaries(remote, server, repository)?;
            params::push_server_parameters(remote, server)?;
        }
        control.stop_servers(servers)?;
        control.start_servers(servers, false)?;

        db.execute(&format!("ALTER SYSTEM START ZONE '{zone}'"), &[])
            .with_context(|| format!("failed to start zone {zone}"))?;

        if per_zone_health_check {
            run_zone_health_check(cluster, executor, destination, servers)
                .with_context(|| format!("health check failed for zone {zone}"))?;
        }
        previous = Some(zone.as_str());
    }

    if let Some(done) = previous {
        gates::wait_zone_started(db, gate, done)?;
    }
    Ok(())
}

/// The health checker connects to a server inside the freshly rolled zone,
/// so its checks see that zone's view of the cluster.
fn run_zone_health_check(
    cluster: &ClusterConfig,
    executor: &mut ScriptExecutor,
    destination: &RouteNode,
    servers: &[ServerConfig],
) -> Result<()> {
    let server = servers
        .first()
        .ok_or_else(|| anyhow!("zone has no servers"))?;
    let params = ConnectParams {
        host: server.host.clone(),
        port: server.sql_port,
        user: cluster.user.clone(),
        password: cluster.password.clone(),
    };
    let outcome = executor.exec_script_on(
        HEALTH_CHECKER_SCRIPT,
        &destination.repository,
        destination.direct_upgrade,
        true,
        &params,
    )?;
    if outcome == scripts::ScriptOutcome::Skipped {
        info!(host = %server.host, "no health checker shipped, skipping");
    }
    Ok(())
}

/// Swaps a server's `bin` and `lib` links over to the new repository.
///
/// The install subsystem lays out `home_dir` with `bin` and `lib` as
/// symlinks into the repository store; the two-step link-then-rename keeps
/// the swap atomic from the server's point of view.
fn swap_server_binaries(
    remote: &mut dyn RemoteSession,
    server: &ServerConfig,
    repository: &SoftwareRepository,
) -> Result<()> {
    for (link, target) in [
        ("bin", repository.bin_dir()),
        ("lib", repository.lib_dir()),
    ] {
        let staged = server.home_dir.join(format!("{link}.upgrade"));
        let current = server.home_dir.join(link);
        let command = format!(
            "ln -sfn {} {} && mv -Tf {} {}",
            target.display(),
            staged.display(),
            staged.display(),
            current.display()
        );
        let output = remote.execute(&server.host, &command)?;
        if !output.success() {
            return Err(anyhow!(
                "failed to swap {link} on {}: {}",
                server.address(),
                output.stderr.trim()
            ));
        }
    }
    Ok(())
}
