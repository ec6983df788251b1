use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

fn default_launcher() -> PathBuf {
    PathBuf::from("reefadmin-script")
}

fn default_gate_poll_interval_secs() -> u64 {
    2
}

fn default_gate_deadline_secs() -> u64 {
    3 * 60 * 60
}

/// Cluster topology and connection settings, parsed from the cluster TOML.
///
/// Read-only to the upgrade engine except for the temporary parameter
/// override/restore performed around zone rolling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_launcher")]
    pub launcher: PathBuf,
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
    #[serde(default = "default_gate_poll_interval_secs")]
    pub gate_poll_interval_secs: u64,
    #[serde(default = "default_gate_deadline_secs")]
    pub gate_deadline_secs: u64,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub zone: String,
    pub sql_port: u16,
    pub rpc_port: u16,
    pub home_dir: PathBuf,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.sql_port)
    }
}

impl ClusterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse cluster config")?;
        if config.name.trim().is_empty() {
            return Err(anyhow!("cluster name must not be empty"));
        }
        if config.user.trim().is_empty() {
            return Err(anyhow!("cluster admin user must not be empty"));
        }
        if config.servers.is_empty() {
            return Err(anyhow!("cluster config declares no servers"));
        }

        let mut seen = HashSet::new();
        for server in &config.servers {
            if server.host.trim().is_empty() {
                return Err(anyhow!("server host must not be empty"));
            }
            if server.zone.trim().is_empty() {
                return Err(anyhow!(
                    "server '{}' has an empty zone name",
                    server.host
                ));
            }
            if !seen.insert(server.address()) {
                return Err(anyhow!(
                    "duplicate server address in cluster config: {}",
                    server.address()
                ));
            }
        }

        Ok(config)
    }

    /// Distinct zone names, in iteration order.
    pub fn zone_names(&self) -> BTreeSet<String> {
        self.servers
            .iter()
            .map(|server| server.zone.clone())
            .collect()
    }

    /// The server used for the administrative SQL connection.
    pub fn primary(&self) -> &ServerConfig {
        &self.servers[0]
    }

    pub fn gate_poll_interval(&self) -> Duration {
        Duration::from_secs(self.gate_poll_interval_secs)
    }

    pub fn gate_deadline(&self) -> Duration {
        Duration::from_secs(self.gate_deadline_secs)
    }
}
