//! Blocking SQL-polled consistency gates.
//!
//! Every structural change during an upgrade is bracketed by gates that wait
//! for the cluster's own reported state: schema propagation, replication
//! sync, compaction progress. All waiting funnels through [`poll_until`],
//! which enforces a deadline so a gate that never converges surfaces as
//! [`GateError::TimedOut`] instead of hanging the run forever.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::session::{DbSession, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    pub interval: Duration,
    pub deadline: Duration,
}

impl GateConfig {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// A gate that gave up is a different failure from a gate whose probe
/// errored; operators react differently to the two.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("consistency gate '{gate}' timed out after {waited_secs}s")]
    TimedOut { gate: String, waited_secs: u64 },
    #[error("consistency gate '{gate}' failed: {source}")]
    Failed {
        gate: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Polls `probe` on a fixed interval until it yields a value or the
/// configured deadline passes. `Ok(None)` means "not yet"; `Err` aborts the
/// gate immediately.
pub fn poll_until<T, F>(gate: &str, config: &GateConfig, mut probe: F) -> Result<T, GateError>
where
    F: FnMut() -> Result<Option<T>>,
{
    let started = Instant::now();
    loop {
        match probe() {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => debug!(gate, "gate condition not met yet"),
            Err(source) => {
                return Err(GateError::Failed {
                    gate: gate.to_string(),
                    source,
                });
            }
        }
        if started.elapsed() >= config.deadline {
            return Err(GateError::TimedOut {
                gate: gate.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }
        thread::sleep(config.interval);
    }
}

fn fetch_count(db: &mut dyn DbSession, sql: &str, args: &[SqlValue]) -> Result<i64> {
    let row = db
        .fetch_one(sql, args)?
        .ok_or_else(|| anyhow!("count query returned no row: {sql}"))?;
    row.get("cnt")
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| anyhow!("count query returned no 'cnt' column: {sql}"))
}

fn bool_word(enabled: bool) -> &'static str {
    if enabled {
        "True"
    } else {
        "False"
    }
}

/// Waits until the cluster reports upgrade mode in the requested state.
pub fn wait_upgrade_mode(
    db: &mut dyn DbSession,
    config: &GateConfig,
    enabled: bool,
) -> Result<(), GateError> {
    let expected = bool_word(enabled);
    poll_until("upgrade_mode", config, || {
        let row = db.fetch_one(
            "SELECT value FROM sys.cluster_parameters WHERE name = 'in_upgrade_mode'",
            &[],
        )?;
        let active = row
            .as_ref()
            .and_then(|row| row.get("value"))
            .and_then(SqlValue::as_str)
            == Some(expected);
        Ok(active.then_some(()))
    })
}

pub fn pending_ddl_count(db: &mut dyn DbSession) -> Result<i64> {
    fetch_count(db, "SELECT COUNT(*) AS cnt FROM sys.ddl_task_queue", &[])
}

/// Waits until no schema-change tasks are queued anywhere in the cluster.
pub fn wait_no_pending_ddl(db: &mut dyn DbSession, config: &GateConfig) -> Result<(), GateError> {
    poll_until("ddl_drain", config, || {
        Ok((pending_ddl_count(db)? == 0).then_some(()))
    })
}

pub fn set_ddl_enabled(db: &mut dyn DbSession, enabled: bool) -> Result<()> {
    db.execute(
        &format!("ALTER SYSTEM SET enable_ddl = '{}'", bool_word(enabled)),
        &[],
    )
    .context("failed to toggle enable_ddl")
}

/// Waits until every server reports the requested `enable_ddl` value.
pub fn wait_ddl_setting(
    db: &mut dyn DbSession,
    config: &GateConfig,
    enabled: bool,
) -> Result<(), GateError> {
    poll_until("ddl_setting_propagation", config, || {
        let lagging = fetch_count(
            db,
            "SELECT COUNT(*) AS cnt FROM sys.server_parameters \
             WHERE name = 'enable_ddl' AND value != ?",
            &[SqlValue::from(bool_word(enabled))],
        )?;
        Ok((lagging == 0).then_some(()))
    })
}

/// Per replication group, the highest position the leader has committed.
pub fn log_sync_targets(db: &mut dyn DbSession) -> Result<Vec<(i64, i64)>> {
    let rows = db.fetch_all(
        "SELECT group_id, MAX(committed_position) AS position FROM sys.log_replicas \
         WHERE role = 'LEADER' GROUP BY group_id",
        &[],
    )?;
    let mut targets = Vec::with_capacity(rows.len());
    for row in rows {
        let group = row
            .get("group_id")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| anyhow!("log sync row is missing group_id"))?;
        let position = row
            .get("position")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| anyhow!("log sync row is missing position"))?;
        targets.push((group, position));
    }
    Ok(targets)
}

/// Log-sync barrier: every follower replica must replay up to the position
/// its leader had committed when the barrier was recorded.
pub fn wait_log_replay(
    db: &mut dyn DbSession,
    config: &GateConfig,
    targets: &[(i64, i64)],
) -> Result<(), GateError> {
    poll_until("log_sync_barrier", config, || {
        for (group, position) in targets {
            let lagging = fetch_count(
                db,
                "SELECT COUNT(*) AS cnt FROM sys.log_replicas \
                 WHERE role != 'LEADER' AND group_id = ? AND replayed_position < ?",
                &[SqlValue::Int(*group), SqlValue::Int(*position)],
            )?;
            if lagging > 0 {
                return Ok(None);
            }
        }
        Ok(Some(()))
    })
}

/// Per-tenant compaction watermarks: broadcast version and the version of
/// the last finished major compaction.
pub fn compaction_watermarks(db: &mut dyn DbSession) -> Result<BTreeMap<i64, (i64, i64)>> {
    let rows = db.fetch_all(
        "SELECT tenant_id, broadcast_version, last_finished_version FROM sys.tenant_compaction",
        &[],
    )?;
    let mut watermarks = BTreeMap::new();
    for row in rows {
        let tenant = row
            .get("tenant_id")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| anyhow!("compaction row is missing tenant_id"))?;
        let broadcast = row
            .get("broadcast_version")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| anyhow!("compaction row is missing broadcast_version"))?;
        let finished = row
            .get("last_finished_version")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| anyhow!("compaction row is missing last_finished_version"))?;
        watermarks.insert(tenant, (broadcast, finished));
    }
    Ok(watermarks)
}

pub fn trigger_major_freeze(db: &mut dyn DbSession) -> Result<()> {
    db.execute("ALTER SYSTEM MAJOR FREEZE", &[])
        .context("failed to trigger major freeze")
}

/// Waits until every tenant's broadcast watermark has advanced past the
/// snapshot taken before the freeze was triggered.
pub fn wait_compaction_started(
    db: &mut dyn DbSession,
    config: &GateConfig,
    snapshot: &BTreeMap<i64, (i64, i64)>,
) -> Result<(), GateError> {
    poll_until("compaction_started", config, || {
        let current = compaction_watermarks(db)?;
        for (tenant, (broadcast_before, _)) in snapshot {
            match current.get(tenant) {
                Some((broadcast_now, _)) if broadcast_now > broadcast_before => {}
                _ => return Ok(None),
            }
        }
        Ok(Some(()))
    })
}

/// Waits until every tenant reports its broadcast watermark as finished.
pub fn wait_compaction_finished(
    db: &mut dyn DbSession,
    config: &GateConfig,
) -> Result<(), GateError> {
    poll_until("compaction_finished", config, || {
        let current = compaction_watermarks(db)?;
        let done = current
            .values()
            .all(|(broadcast, finished)| broadcast == finished);
        Ok(done.then_some(()))
    })
}

fn zone_status(db: &mut dyn DbSession, zone: &str) -> Result<Option<String>> {
    let row = db.fetch_one(
        "SELECT status FROM sys.zones WHERE zone = ?",
        &[SqlValue::from(zone)],
    )?;
    Ok(row
        .and_then(|row| row.get("status").and_then(SqlValue::as_str).map(String::from)))
}

pub fn wait_zone_inactive(
    db: &mut dyn DbSession,
    config: &GateConfig,
    zone: &str,
) -> Result<(), GateError> {
    poll_until("zone_inactive", config, || {
        Ok((zone_status(db, zone)?.as_deref() == Some("INACTIVE")).then_some(()))
    })
}

/// Waits for a zone to be active again with every server in it serving.
pub fn wait_zone_started(
    db: &mut dyn DbSession,
    config: &GateConfig,
    zone: &str,
) -> Result<(), GateError> {
    poll_until("zone_started", config, || {
        if zone_status(db, zone)?.as_deref() != Some("ACTIVE") {
            return Ok(None);
        }
        let unready = fetch_count(
            db,
            "SELECT COUNT(*) AS cnt FROM sys.servers \
             WHERE zone = ? AND (status != 'ACTIVE' OR start_service_time = 0)",
            &[SqlValue::from(zone)],
        )?;
        Ok((unready == 0).then_some(()))
    })
}

/// Waits until every server in the cluster is active and serving.
pub fn wait_cluster_healthy(db: &mut dyn DbSession, config: &GateConfig) -> Result<(), GateError> {
    poll_until("cluster_healthy", config, || {
        let unready = fetch_count(
            db,
            "SELECT COUNT(*) AS cnt FROM sys.servers \
             WHERE status != 'ACTIVE' OR start_service_time = 0",
            &[],
        )?;
        Ok((unready == 0).then_some(()))
    })
}

/// Waits until every server in the zone has observed the newest schema for
/// all tenants. A zone mid-propagation must not be stopped.
pub fn wait_schema_refreshed(
    db: &mut dyn DbSession,
    config: &GateConfig,
    zone: &str,
) -> Result<(), GateError> {
    poll_until("schema_refreshed", config, || {
        let stale = fetch_count(
            db,
            "SELECT COUNT(*) AS cnt FROM sys.server_schema_info \
             WHERE zone = ? AND refreshed_schema_version < newest_schema_version",
            &[SqlValue::from(zone)],
        )?;
        Ok((stale == 0).then_some(()))
    })
}

/// Waits until the zone's replicas report no pending replication backlog.
pub fn wait_no_replication_backlog(
    db: &mut dyn DbSession,
    config: &GateConfig,
    zone: &str,
) -> Result<(), GateError> {
    poll_until("replication_backlog", config, || {
        let pending = fetch_count(
            db,
            "SELECT COUNT(*) AS cnt FROM sys.replica_sync_status \
             WHERE zone = ? AND pending_log_count > 0",
            &[SqlValue::from(zone)],
        )?;
        Ok((pending == 0).then_some(()))
    })
}

/// Attempts to freeze structural work before a race re-check gives up.
const DDL_QUIESCE_ATTEMPTS: usize = 5;

/// The multi-phase quiesce barrier run before binaries are swapped under a
/// live cluster:
///
/// 1. drain outstanding schema-change tasks,
/// 2. disable schema changes cluster-wide and wait for the setting to
///    propagate,
/// 3. re-check that no task raced in during disablement (re-enable and
///    retry from the top if one did),
/// 4. log-sync barrier: followers replay up to their leader's committed
///    position,
/// 5. trigger a major freeze and wait for it to start and finish on every
///    tenant.
pub fn quiesce_structural_work(db: &mut dyn DbSession, config: &GateConfig) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        wait_no_pending_ddl(db, config)?;
        set_ddl_enabled(db, false)?;
        wait_ddl_setting(db, config, false)?;

        if pending_ddl_count(db)? == 0 {
            break;
        }
        warn!(attempt, "schema-change task raced in during disablement, retrying");
        set_ddl_enabled(db, true)?;
        if attempt >= DDL_QUIESCE_ATTEMPTS {
            return Err(anyhow!(
                "schema-change tasks kept racing in after {DDL_QUIESCE_ATTEMPTS} quiesce attempts"
            ));
        }
    }

    let targets = log_sync_targets(db)?;
    wait_log_replay(db, config, &targets)?;

    let snapshot = compaction_watermarks(db)?;
    trigger_major_freeze(db)?;
    wait_compaction_started(db, config, &snapshot)?;
    wait_compaction_finished(db, config)?;
    Ok(())
}
