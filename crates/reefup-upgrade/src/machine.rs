//! The resumable upgrade state machine.
//!
//! One invocation of [`UpgradeMachine::run_stage`] drives at most one
//! binary-level stage: the caller decides whether to re-invoke for the
//! next stage, which keeps a natural re-entry point between stages. The
//! checkpoint is persisted after every pipeline step (and after every
//! individual migration script), so a crash or abort resumes at the step
//! that was in flight. There is no rollback: a failed run leaves the
//! checkpoint in place and the cluster wherever the last completed step
//! left it.

use anyhow::{anyhow, Context, Result};
use reefup_core::{CheckpointStore, ClusterConfig, RouteNode, UpgradeCheckpoint};
use reefup_route::next_stage_index;
use tracing::{info, warn};

use crate::gates::{self, GateConfig};
use crate::pipeline::{PipelineStep, VersionFamily, CHECKER_SCRIPT, POST_SCRIPT, PRE_SCRIPT};
use crate::scripts::{ConnectParams, LocalLauncher, ScriptExecutor, ScriptLauncher, StagingLayout};
use crate::session::{AdminConnector, DbSession, RemoteSession, ServiceControl};
use crate::{params, zones};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage finished; more route nodes remain.
    StageComplete,
    /// The route is exhausted; the cluster runs the target version.
    UpgradeComplete,
}

pub struct UpgradeMachine<'a> {
    cluster: &'a ClusterConfig,
    checkpoint: UpgradeCheckpoint,
    store: &'a dyn CheckpointStore,
    remote: &'a mut dyn RemoteSession,
    control: &'a mut dyn ServiceControl,
    connector: &'a mut dyn AdminConnector,
    scripts: ScriptExecutor,
    gate: GateConfig,
    db: Option<Box<dyn DbSession>>,
}

impl<'a> UpgradeMachine<'a> {
    pub fn new(
        cluster: &'a ClusterConfig,
        checkpoint: UpgradeCheckpoint,
        store: &'a dyn CheckpointStore,
        remote: &'a mut dyn RemoteSession,
        control: &'a mut dyn ServiceControl,
        connector: &'a mut dyn AdminConnector,
    ) -> Self {
        let launcher = Box::new(LocalLauncher::new(&cluster.launcher));
        Self::with_launcher(cluster, checkpoint, store, remote, control, connector, launcher)
    }

    pub fn with_launcher(
        cluster: &'a ClusterConfig,
        checkpoint: UpgradeCheckpoint,
        store: &'a dyn CheckpointStore,
        remote: &'a mut dyn RemoteSession,
        control: &'a mut dyn ServiceControl,
        connector: &'a mut dyn AdminConnector,
        launcher: Box<dyn ScriptLauncher>,
    ) -> Self {
        let layout = StagingLayout::new(cluster.staging_root.as_deref(), &cluster.servers);
        let primary = cluster.primary();
        let connect = ConnectParams {
            host: primary.host.clone(),
            port: primary.sql_port,
            user: cluster.user.clone(),
            password: cluster.password.clone(),
        };
        let gate = GateConfig::new(cluster.gate_poll_interval(), cluster.gate_deadline());
        Self {
            cluster,
            checkpoint,
            store,
            remote,
            control,
            connector,
            scripts: ScriptExecutor::new(layout, launcher, connect),
            gate,
            db: None,
        }
    }

    pub fn checkpoint(&self) -> &UpgradeCheckpoint {
        &self.checkpoint
    }

    /// Runs the pipeline for the next binary-level stage.
    ///
    /// Re-entry safe: a checkpoint captured mid-stage resumes at the step
    /// it recorded, and every step is written to be re-run from the top.
    pub fn run_stage(&mut self) -> Result<StageOutcome> {
        if self.checkpoint.is_complete() {
            return Ok(StageOutcome::UpgradeComplete);
        }

        let stage = next_stage_index(&self.checkpoint.route, self.checkpoint.route_index);
        let destination = self.checkpoint.route[stage].clone();
        let family = VersionFamily::of(&destination.repository.version);
        let pipeline = family.pipeline();
        if self.checkpoint.process_index > pipeline.len() {
            return Err(anyhow!(
                "checkpoint process_index {} is out of range for a {}-step pipeline",
                self.checkpoint.process_index,
                pipeline.len()
            ));
        }

        info!(
            stage,
            version = %destination.repository.version,
            resume_step = self.checkpoint.process_index,
            "running upgrade stage"
        );

        // The current software must be up and reachable before any step
        // runs: push configured parameters, start without bootstrap, then
        // retry the administrative connection until the cluster answers.
        params::push_configured_parameters(&mut *self.remote, self.cluster)?;
        self.control.start_servers(&self.cluster.servers, false)?;
        self.db = Some(self.connect_admin()?);

        while self.checkpoint.process_index < pipeline.len() {
            let step = pipeline[self.checkpoint.process_index];
            info!(step = step.name(), "pipeline step starting");
            match self.run_step(step, stage, &destination, family) {
                Ok(()) => {
                    self.checkpoint.process_index += 1;
                    self.checkpoint.process_route_index = self.checkpoint.route_index;
                    self.store.save(&self.checkpoint)?;
                }
                Err(err) => {
                    // Persist the checkpoint exactly as it stood so the
                    // next run re-attempts this step from the top.
                    self.store.save(&self.checkpoint)?;
                    return Err(err.context(format!("pipeline step '{}' failed", step.name())));
                }
            }
        }

        self.checkpoint.route_index = stage + 1;
        self.checkpoint.process_index = 0;
        self.checkpoint.process_route_index = self.checkpoint.route_index;
        self.scripts.clear_staged()?;
        self.store.save(&self.checkpoint)?;

        if self.checkpoint.is_complete() {
            info!("upgrade complete");
            Ok(StageOutcome::UpgradeComplete)
        } else {
            Ok(StageOutcome::StageComplete)
        }
    }

    fn run_step(
        &mut self,
        step: PipelineStep,
        stage: usize,
        destination: &RouteNode,
        family: VersionFamily,
    ) -> Result<()> {
        let gate = self.gate;
        match step {
            PipelineStep::PreflightChecker | PipelineStep::PostflightChecker => {
                self.scripts
                    .exec_script(
                        CHECKER_SCRIPT,
                        &destination.repository,
                        destination.direct_upgrade,
                        true,
                    )
                    .map(drop)
            }
            PipelineStep::BackupParameters => {
                // Keep an existing snapshot on resume so restore writes the
                // original values, never an override.
                if self.checkpoint.backup_params.is_none() {
                    let db = self.require_db()?;
                    let backup = params::backup_parameters(db)?;
                    self.checkpoint.backup_params = Some(backup);
                }
                Ok(())
            }
            PipelineStep::EnableUpgradeMode => {
                let db = self.require_db()?;
                db.execute("ALTER SYSTEM BEGIN UPGRADE", &[])
                    .context("failed to enter upgrade mode")?;
                gates::wait_upgrade_mode(db, &gate, true)?;
                Ok(())
            }
            PipelineStep::RunPreScripts => self.run_migration_scripts(PRE_SCRIPT, stage),
            PipelineStep::QuiesceStructuralWork => {
                gates::quiesce_structural_work(self.require_db()?, &gate)
            }
            PipelineStep::RollZones => {
                if family.overrides_parameters() {
                    let db = self.require_db()?;
                    params::apply_rolling_overrides(db)?;
                }
                {
                    let db = self
                        .db
                        .as_mut()
                        .ok_or_else(|| anyhow!("administrative session not established"))?;
                    zones::roll_zones(
                        self.cluster,
                        &mut **db,
                        &mut *self.remote,
                        &mut *self.control,
                        &mut self.scripts,
                        &gate,
                        destination,
                        family.per_zone_health_check(),
                    )?;
                }
                // The administrative endpoint itself restarted during the
                // roll; re-establish before the remaining steps.
                self.db = Some(self.connect_admin()?);
                Ok(())
            }
            PipelineStep::UpgradeVirtualSchema => {
                let db = self.require_db()?;
                db.execute("ALTER SYSTEM UPGRADE VIRTUAL SCHEMA", &[])
                    .context("failed to upgrade virtual schema")
            }
            PipelineStep::RunPostScripts => self.run_migration_scripts(POST_SCRIPT, stage),
            PipelineStep::DisableUpgradeMode => {
                let db = self.require_db()?;
                if family.quiesces_structural_work() {
                    gates::set_ddl_enabled(db, true)?;
                    gates::wait_ddl_setting(db, &gate, true)?;
                }
                db.execute("ALTER SYSTEM END UPGRADE", &[])
                    .context("failed to leave upgrade mode")?;
                gates::wait_upgrade_mode(db, &gate, false)?;
                Ok(())
            }
            PipelineStep::RootInspection => {
                let db = self.require_db()?;
                db.execute("ALTER SYSTEM RUN JOB 'root_inspection'", &[])
                    .context("failed to trigger root inspection")
            }
            PipelineStep::RestoreParameters => {
                let backup = self.checkpoint.backup_params.clone();
                if let Some(backup) = backup {
                    let db = self.require_db()?;
                    params::restore_parameters(db, &backup)?;
                    self.checkpoint.backup_params = None;
                } else {
                    warn!("no parameter backup recorded, nothing to restore");
                }
                Ok(())
            }
        }
    }

    /// Runs one migration script per route node folded into this stage,
    /// from wherever the checkpoint says scripts last completed.
    ///
    /// A node whose version equals its predecessor's carries no migration
    /// of its own and is skipped; that is what lets several folded minor
    /// versions each ship scripts without re-running unchanged ones.
    fn run_migration_scripts(&mut self, script: &str, stage: usize) -> Result<()> {
        let start = self
            .checkpoint
            .process_route_index
            .max(self.checkpoint.route_index);
        for index in start..=stage {
            let node = self.checkpoint.route[index].clone();
            let previous = &self.checkpoint.route[index - 1].repository.version;
            if &node.repository.version == previous {
                info!(
                    script,
                    version = %node.repository.version,
                    "skipping migration script for unchanged version"
                );
            } else {
                self.scripts
                    .exec_script(script, &node.repository, node.direct_upgrade, true)?;
            }
            self.checkpoint.process_route_index = index + 1;
            self.store.save(&self.checkpoint)?;
        }
        Ok(())
    }

    fn connect_admin(&mut self) -> Result<Box<dyn DbSession>> {
        let gate = self.gate;
        let connector = &mut *self.connector;
        let session = gates::poll_until("admin_connect", &gate, || match connector.connect() {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(error = %err, "administrative connection not ready");
                Ok(None)
            }
        })?;
        Ok(session)
    }

    fn require_db(&mut self) -> Result<&mut dyn DbSession> {
        Ok(&mut **self
            .db
            .as_mut()
            .ok_or_else(|| anyhow!("administrative session not established"))?)
    }
}
