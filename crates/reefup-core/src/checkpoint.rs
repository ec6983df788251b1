use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::repository::SoftwareRepository;

/// Current checkpoint schema version. Increment on breaking changes.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// One planned transition in the upgrade route.
///
/// Node 0 is the version the cluster is currently running; every later node
/// is a version to move through. The route is computed once per upgrade
/// request and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNode {
    pub repository: SoftwareRepository,
    pub require_from_binary: bool,
    pub direct_upgrade: bool,
}

/// Cluster tuning parameters saved before a stage temporarily overrides
/// them, keyed by server address then parameter name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterBackup {
    pub values: std::collections::BTreeMap<String, std::collections::BTreeMap<String, String>>,
}

/// The only state that crosses process restarts.
///
/// `route_index` is the index of the next unprocessed route node.
/// `process_index` is the offset into the fixed pipeline for the stage in
/// flight. `process_route_index` is the index of the next route node whose
/// migration scripts have not completed within the current stage; it
/// advances per script, independently of `process_index`, because several
/// route nodes fold into one binary-level stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeCheckpoint {
    pub schema_version: u32,
    pub component: String,
    pub route: Vec<RouteNode>,
    pub route_index: usize,
    pub process_index: usize,
    pub process_route_index: usize,
    #[serde(default)]
    pub backup_params: Option<ParameterBackup>,
}

impl UpgradeCheckpoint {
    pub fn new(component: impl Into<String>, route: Vec<RouteNode>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            component: component.into(),
            route,
            route_index: 1,
            process_index: 0,
            process_route_index: 0,
            backup_params: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.route_index >= self.route.len()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize upgrade checkpoint")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let checkpoint: Self =
            serde_json::from_str(raw).context("failed to parse upgrade checkpoint")?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(anyhow!(
                "checkpoint schema version mismatch: expected {CHECKPOINT_SCHEMA_VERSION}, got {}",
                checkpoint.schema_version
            ));
        }
        if checkpoint.route.len() < 2 {
            return Err(anyhow!(
                "checkpoint route has {} node(s), need at least 2",
                checkpoint.route.len()
            ));
        }
        if checkpoint.route_index == 0 || checkpoint.route_index > checkpoint.route.len() {
            return Err(anyhow!(
                "checkpoint route_index {} is out of range for a route of {} nodes",
                checkpoint.route_index,
                checkpoint.route.len()
            ));
        }
        Ok(checkpoint)
    }
}

/// Durable storage for the upgrade checkpoint. The engine never holds a
/// reference into the persisted representation: every save serializes and
/// every load deserializes a fresh snapshot.
pub trait CheckpointStore {
    fn load(&self) -> Result<Option<UpgradeCheckpoint>>;
    fn save(&self, checkpoint: &UpgradeCheckpoint) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file store with write-to-temp-then-rename so readers see either the
/// old checkpoint or the new one, never a partial write.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<UpgradeCheckpoint>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read checkpoint file: {}", self.path.display())
                });
            }
        };
        let checkpoint = UpgradeCheckpoint::from_json(&raw)
            .with_context(|| format!("invalid checkpoint file: {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &UpgradeCheckpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload = checkpoint.to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload.as_bytes())
            .with_context(|| format!("failed to write checkpoint file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed to move checkpoint into place: {}",
                self.path.display()
            )
        })?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove checkpoint file: {}", self.path.display())
            }),
        }
    }
}
