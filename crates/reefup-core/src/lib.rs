mod checkpoint;
mod config;
mod repository;

pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, ParameterBackup, RouteNode, UpgradeCheckpoint,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use config::{ClusterConfig, ServerConfig};
pub use repository::{RepositoryManifest, RepositoryStore, SoftwareRepository};

#[cfg(test)]
mod tests;
