//! Route planning for rolling upgrades.
//!
//! A route is the ordered sequence of version transitions from the running
//! repository to the target. Planning is a pure function of the installed
//! chain, so recomputing the route on a resumed run yields the same result.

use anyhow::{anyhow, Result};
use reefup_core::{RouteNode, SoftwareRepository, UpgradeCheckpoint};

/// Builds the upgrade route from an ordered chain of installed repositories.
///
/// The chain runs from the currently running version (node 0) to the target
/// (last node) and must hold at least two entries. Versions may not
/// decrease; equal adjacent versions are legal and become skip nodes for
/// the migration-script pass.
pub fn plan_route(chain: &[SoftwareRepository]) -> Result<Vec<RouteNode>> {
    if chain.len() < 2 {
        return Err(anyhow!(
            "upgrade chain needs at least the running and the target repository, got {}",
            chain.len()
        ));
    }

    let mut route = Vec::with_capacity(chain.len());
    for (index, repository) in chain.iter().enumerate() {
        if index > 0 && repository.version < chain[index - 1].version {
            return Err(anyhow!(
                "upgrade chain is not ordered: {} follows {}",
                repository.version,
                chain[index - 1].version
            ));
        }
        // Node 0 is the running version; nothing is required to reach it.
        let first = index == 0;
        route.push(RouteNode {
            repository: repository.clone(),
            require_from_binary: !first && repository.require_from_binary,
            direct_upgrade: !first && repository.direct_upgrade,
        });
    }

    Ok(route)
}

/// Index of the next binary-level stage: the first node at or after
/// `route_index` that requires a binary swap, or the last node when none
/// does. Every node in between folds into that stage.
pub fn next_stage_index(route: &[RouteNode], route_index: usize) -> usize {
    for (index, node) in route.iter().enumerate().skip(route_index) {
        if node.require_from_binary {
            return index;
        }
    }
    route.len() - 1
}

/// Checks that a freshly planned route matches the one recorded in a resume
/// checkpoint. A mismatch means the install root changed under a half-done
/// upgrade, which is not resumable.
pub fn verify_resumed_route(route: &[RouteNode], checkpoint: &UpgradeCheckpoint) -> Result<()> {
    if route.len() != checkpoint.route.len() {
        return Err(anyhow!(
            "resumed route has {} node(s) but checkpoint recorded {}",
            route.len(),
            checkpoint.route.len()
        ));
    }
    for (fresh, recorded) in route.iter().zip(&checkpoint.route) {
        if fresh.repository.version != recorded.repository.version
            || fresh.repository.hash != recorded.repository.hash
        {
            return Err(anyhow!(
                "resumed route diverges at version {}: checkpoint recorded {}",
                fresh.repository.version,
                recorded.repository.version
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
