//! Fixed per-family upgrade pipelines.
//!
//! The pipeline shape is not user-definable: each product-version family
//! carries a fixed ordered step list, selected by a version-range lookup on
//! the stage's destination version. One state machine executes them all.

use semver::Version;

/// Script names shipped in every repository's script set.
pub const PRE_SCRIPT: &str = "upgrade_pre.sql";
pub const POST_SCRIPT: &str = "upgrade_post.sql";
pub const CHECKER_SCRIPT: &str = "upgrade_checker.sql";
pub const HEALTH_CHECKER_SCRIPT: &str = "upgrade_health_checker.sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    PreflightChecker,
    BackupParameters,
    EnableUpgradeMode,
    RunPreScripts,
    QuiesceStructuralWork,
    RollZones,
    UpgradeVirtualSchema,
    RunPostScripts,
    DisableUpgradeMode,
    RootInspection,
    PostflightChecker,
    RestoreParameters,
}

impl PipelineStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreflightChecker => "preflight_checker",
            Self::BackupParameters => "backup_parameters",
            Self::EnableUpgradeMode => "enable_upgrade_mode",
            Self::RunPreScripts => "run_pre_scripts",
            Self::QuiesceStructuralWork => "quiesce_structural_work",
            Self::RollZones => "roll_zones",
            Self::UpgradeVirtualSchema => "upgrade_virtual_schema",
            Self::RunPostScripts => "run_post_scripts",
            Self::DisableUpgradeMode => "disable_upgrade_mode",
            Self::RootInspection => "root_inspection",
            Self::PostflightChecker => "postflight_checker",
            Self::RestoreParameters => "restore_parameters",
        }
    }
}

const V2_PIPELINE: &[PipelineStep] = &[
    PipelineStep::PreflightChecker,
    PipelineStep::EnableUpgradeMode,
    PipelineStep::RunPreScripts,
    PipelineStep::RollZones,
    PipelineStep::UpgradeVirtualSchema,
    PipelineStep::RunPostScripts,
    PipelineStep::DisableUpgradeMode,
    PipelineStep::RootInspection,
    PipelineStep::PostflightChecker,
];

const V3_PIPELINE: &[PipelineStep] = &[
    PipelineStep::PreflightChecker,
    PipelineStep::BackupParameters,
    PipelineStep::EnableUpgradeMode,
    PipelineStep::RunPreScripts,
    PipelineStep::QuiesceStructuralWork,
    PipelineStep::RollZones,
    PipelineStep::UpgradeVirtualSchema,
    PipelineStep::RunPostScripts,
    PipelineStep::DisableUpgradeMode,
    PipelineStep::RootInspection,
    PipelineStep::PostflightChecker,
    PipelineStep::RestoreParameters,
];

/// Product generations with distinct pipeline shapes. Selected by the
/// destination version of each binary stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionFamily {
    /// Pre-3.0 servers: no structural-work quiesce, no parameter juggling.
    V2,
    /// 3.0 and later: quiesce barrier, parameter backup/restore, per-zone
    /// health checks during rolling.
    V3,
}

impl VersionFamily {
    pub fn of(version: &Version) -> Self {
        if version.major >= 3 {
            Self::V3
        } else {
            Self::V2
        }
    }

    pub fn pipeline(&self) -> &'static [PipelineStep] {
        match self {
            Self::V2 => V2_PIPELINE,
            Self::V3 => V3_PIPELINE,
        }
    }

    /// Later generations run the health checker against each zone right
    /// after its rolling swap, not only at the end of the stage.
    pub fn per_zone_health_check(&self) -> bool {
        matches!(self, Self::V3)
    }

    /// Whether this family temporarily overrides cluster tuning parameters
    /// around the rolling swap (and therefore must back them up first).
    pub fn overrides_parameters(&self) -> bool {
        matches!(self, Self::V3)
    }

    /// Whether this family freezes structural work (DDL, compaction)
    /// before the swap; the freeze is undone when upgrade mode ends.
    pub fn quiesces_structural_work(&self) -> bool {
        matches!(self, Self::V3)
    }
}
