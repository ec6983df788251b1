//! Collaborator seams for the upgrade engine.
//!
//! The remote-execution transport, the administrative SQL connection and the
//! surrounding start/stop machinery are external subsystems; the engine only
//! sees these traits. Tests drive the engine through mock implementations.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use reefup_core::ServerConfig;

/// Result of one remote (or local) command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes commands and transfers files against one named host. Nothing
/// beyond POSIX shell semantics is assumed on the remote side.
pub trait RemoteSession {
    fn execute(&mut self, host: &str, command: &str) -> Result<CommandOutput>;
    fn put_file(&mut self, host: &str, local: &Path, remote: &Path) -> Result<()>;
    fn put_dir(&mut self, host: &str, local: &Path, remote: &Path) -> Result<()>;
}

/// A single SQL value as returned by the administrative connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
            Self::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

pub type Row = BTreeMap<String, SqlValue>;

/// Administrative SQL session against the cluster.
///
/// An `Err` means the statement itself failed (connection or SQL error); a
/// query that legitimately matches nothing returns `Ok(None)` / an empty
/// vec. Callers must not conflate the two.
pub trait DbSession {
    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<()>;
    fn fetch_one(&mut self, sql: &str, args: &[SqlValue]) -> Result<Option<Row>>;
    fn fetch_all(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>>;
}

/// External start/stop procedures for a set of servers. The upgrade engine
/// never bootstraps; it always starts on whatever binaries are linked.
pub trait ServiceControl {
    fn start_servers(&mut self, servers: &[ServerConfig], bootstrap: bool) -> Result<()>;
    fn stop_servers(&mut self, servers: &[ServerConfig]) -> Result<()>;
}

/// Produces administrative sessions. Connection failures are expected while
/// servers restart; the engine wraps `connect` in a bounded retry gate.
pub trait AdminConnector {
    fn connect(&mut self) -> Result<Box<dyn DbSession>>;
}
