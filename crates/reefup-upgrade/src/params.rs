//! Cluster tuning-parameter backup, override and restore.
//!
//! Zone rolling temporarily overrides a fixed set of parameters (longer
//! permanent-offline window, no rebalance, no re-replication) so the
//! cluster does not treat a deliberately stopped zone as failed. The
//! original values are snapshotted into the checkpoint before the stage
//! quiesces and written back once the stage completes, so a crash between
//! the two never loses them.

use anyhow::{anyhow, Context, Result};
use reefup_core::{ClusterConfig, ParameterBackup, ServerConfig};
use tracing::info;

use crate::session::{DbSession, RemoteSession, SqlValue};

/// Parameters saved before rolling and restored afterwards.
pub const BACKUP_PARAMETER_NAMES: [&str; 3] = [
    "server_permanent_offline_time",
    "enable_rebalance",
    "enable_rereplication",
];

/// Values in force while zones are being rolled.
pub const ROLLING_OVERRIDES: [(&str, &str); 3] = [
    ("server_permanent_offline_time", "7200"),
    ("enable_rebalance", "False"),
    ("enable_rereplication", "False"),
];

/// Snapshots the backup parameter set, per server.
pub fn backup_parameters(db: &mut dyn DbSession) -> Result<ParameterBackup> {
    let name_list = BACKUP_PARAMETER_NAMES
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let rows = db.fetch_all(
        &format!("SELECT server, name, value FROM sys.server_parameters WHERE name IN ({name_list})"),
        &[],
    )?;

    let mut backup = ParameterBackup::default();
    for row in rows {
        let server = row
            .get("server")
            .and_then(SqlValue::as_str)
            .ok_or_else(|| anyhow!("parameter row is missing server"))?;
        let name = row
            .get("name")
            .and_then(SqlValue::as_str)
            .ok_or_else(|| anyhow!("parameter row is missing name"))?;
        let value = row
            .get("value")
            .and_then(SqlValue::as_str)
            .ok_or_else(|| anyhow!("parameter row is missing value"))?;
        backup
            .values
            .entry(server.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }
    Ok(backup)
}

/// Applies the cluster-wide rolling overrides. Safe to repeat.
pub fn apply_rolling_overrides(db: &mut dyn DbSession) -> Result<()> {
    for (name, value) in ROLLING_OVERRIDES {
        db.execute(&format!("ALTER SYSTEM SET {name} = '{value}'"), &[])
            .with_context(|| format!("failed to override parameter {name}"))?;
    }
    Ok(())
}

/// Writes the snapshotted values back, per server.
pub fn restore_parameters(db: &mut dyn DbSession, backup: &ParameterBackup) -> Result<()> {
    for (server, parameters) in &backup.values {
        for (name, value) in parameters {
            db.execute(
                &format!("ALTER SYSTEM SET {name} = '{value}' SERVER = '{server}'"),
                &[],
            )
            .with_context(|| format!("failed to restore parameter {name} on {server}"))?;
        }
    }
    info!(
        servers = backup.values.len(),
        "restored cluster tuning parameters"
    );
    Ok(())
}

/// Rewrites every server's parameter file from the cluster config. Runs
/// before the stage (re)starts the current software, so it cannot go over
/// SQL; repeat-safe because the file is rewritten wholesale.
pub fn push_configured_parameters(
    remote: &mut dyn RemoteSession,
    cluster: &ClusterConfig,
) -> Result<()> {
    for server in &cluster.servers {
        push_server_parameters(remote, server)?;
    }
    Ok(())
}

pub fn push_server_parameters(
    remote: &mut dyn RemoteSession,
    server: &ServerConfig,
) -> Result<()> {
    let body = server
        .parameters
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("\n");
    let etc_dir = server.home_dir.join("etc");
    let file = etc_dir.join("reef.parameters");
    let command = format!(
        "mkdir -p {} && printf '%s\\n' '{body}' > {}",
        etc_dir.display(),
        file.display()
    );

    let output = remote.execute(&server.host, &command)?;
    if !output.success() {
        return Err(anyhow!(
            "failed to write parameter file on {}: {}",
            server.address(),
            output.stderr.trim()
        ));
    }
    Ok(())
}
