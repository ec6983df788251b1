//! Upgrade orchestration engine for ReefDB clusters.
//!
//! Drives live rolling version upgrades against a multi-zone cluster: the
//! route planner (in `reefup-route`) decides which versions to move
//! through, the state machine here walks a fixed per-family pipeline one
//! binary stage at a time, and every structural change is gated on the
//! cluster's own reported state.

pub mod gates;
pub mod machine;
pub mod params;
pub mod pipeline;
pub mod preflight;
pub mod scripts;
pub mod session;
pub mod zones;

pub use gates::{GateConfig, GateError};
pub use machine::{StageOutcome, UpgradeMachine};
pub use pipeline::{PipelineStep, VersionFamily};
pub use preflight::{run_preflight_checks, CheckReport};
pub use scripts::{
    ConnectParams, LocalLauncher, ScriptExecutor, ScriptLauncher, ScriptOutcome, StagingLayout,
};
pub use session::{
    AdminConnector, CommandOutput, DbSession, RemoteSession, Row, ServiceControl, SqlValue,
};
pub use zones::RollMode;
