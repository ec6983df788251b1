//! Preflight checks run before an upgrade attempt touches the cluster.
//!
//! Each check records its verdict into an explicit [`CheckReport`]; the
//! caller inspects the accumulated result. Checks never abort early, so an
//! operator sees every problem at once instead of fixing them one by one.

use reefup_core::{ClusterConfig, RouteNode};
use tracing::warn;

use crate::zones::{zone_groups, RollMode};

/// Accumulated outcome of the preflight checks.
#[derive(Debug, Default)]
pub struct CheckReport {
    passed: Vec<&'static str>,
    failures: Vec<String>,
}

impl CheckReport {
    fn pass(&mut self, check: &'static str) {
        self.passed.push(check);
    }

    fn fail(&mut self, check: &'static str, reason: String) {
        warn!(check, reason = %reason, "preflight check failed");
        self.failures.push(format!("{check}: {reason}"));
    }

    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn passed(&self) -> &[&'static str] {
        &self.passed
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

/// Validates the cluster/route combination before any state changes.
pub fn run_preflight_checks(cluster: &ClusterConfig, route: &[RouteNode]) -> CheckReport {
    let mut report = CheckReport::default();

    check_route_shape(route, &mut report);
    check_repositories_on_disk(route, &mut report);
    check_zone_layout(cluster, &mut report);

    report
}

fn check_route_shape(route: &[RouteNode], report: &mut CheckReport) {
    const CHECK: &str = "route_shape";
    if route.len() < 2 {
        report.fail(CHECK, format!("route has {} node(s)", route.len()));
        return;
    }
    let ordered = route
        .windows(2)
        .all(|pair| pair[0].repository.version <= pair[1].repository.version);
    if !ordered {
        report.fail(CHECK, "route versions are not ascending".to_string());
        return;
    }
    report.pass(CHECK);
}

fn check_repositories_on_disk(route: &[RouteNode], report: &mut CheckReport) {
    const CHECK: &str = "repositories_installed";
    let mut missing = Vec::new();
    for node in route.iter().skip(1) {
        if !node.repository.root.exists() {
            missing.push(node.repository.version.to_string());
        }
    }
    if missing.is_empty() {
        report.pass(CHECK);
    } else {
        report.fail(
            CHECK,
            format!("repository root missing for version(s): {}", missing.join(", ")),
        );
    }
}

fn check_zone_layout(cluster: &ClusterConfig, report: &mut CheckReport) {
    const CHECK: &str = "zone_layout";
    let groups = zone_groups(cluster);
    if groups.is_empty() {
        report.fail(CHECK, "cluster has no zones".to_string());
        return;
    }
    // A single-server zone in rolling mode means that zone's data has no
    // serving replica while it rolls; worth surfacing, not fatal.
    if RollMode::select(groups.len()) == RollMode::Rolling {
        for (zone, servers) in &groups {
            if servers.len() == 1 {
                warn!(zone = %zone, "zone holds a single server, it will be briefly dark while rolling");
            }
        }
    }
    report.pass(CHECK);
}
