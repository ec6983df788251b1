//! Production adapters behind the engine's collaborator traits.
//!
//! The remote transport shells out to `ssh`/`scp` (plain `sh -c` for local
//! hosts), service control drives each server's `reefserver-ctl`, and the
//! administrative SQL session runs statements through the admin client in
//! batch mode, parsing its tab-separated output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use reefup_core::{ClusterConfig, ServerConfig};
use reefup_upgrade::{
    AdminConnector, CommandOutput, DbSession, RemoteSession, Row, ServiceControl, SqlValue,
};
use tracing::debug;

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn output_of(command: &mut Command) -> Result<CommandOutput> {
    let output = command
        .output()
        .with_context(|| format!("failed to spawn: {command:?}"))?;
    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// `ssh`-backed remote session; local hosts skip the hop.
#[derive(Debug, Default)]
pub struct SshRemoteSession;

impl SshRemoteSession {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteSession for SshRemoteSession {
    fn execute(&mut self, host: &str, command: &str) -> Result<CommandOutput> {
        debug!(host, command, "remote execute");
        let mut invocation = if is_local(host) {
            let mut invocation = Command::new("sh");
            invocation.args(["-c", command]);
            invocation
        } else {
            let mut invocation = Command::new("ssh");
            invocation.args(["-o", "BatchMode=yes", host, command]);
            invocation
        };
        output_of(&mut invocation)
    }

    fn put_file(&mut self, host: &str, local: &Path, remote: &Path) -> Result<()> {
        self.transfer(host, local, remote, false)
    }

    fn put_dir(&mut self, host: &str, local: &Path, remote: &Path) -> Result<()> {
        self.transfer(host, local, remote, true)
    }
}

impl SshRemoteSession {
    fn transfer(&mut self, host: &str, local: &Path, remote: &Path, recursive: bool) -> Result<()> {
        let output = if is_local(host) {
            let mut invocation = Command::new("cp");
            if recursive {
                invocation.arg("-r");
            }
            invocation.arg(local).arg(remote);
            output_of(&mut invocation)?
        } else {
            let mut invocation = Command::new("scp");
            if recursive {
                invocation.arg("-r");
            }
            invocation
                .arg(local)
                .arg(format!("{host}:{}", remote.display()));
            output_of(&mut invocation)?
        };
        if !output.success() {
            return Err(anyhow!(
                "file transfer to {host} failed: {}",
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}

/// Drives each server's control script over the remote session.
#[derive(Default)]
pub struct CtlServiceControl {
    remote: SshRemoteSession,
}

impl CtlServiceControl {
    pub fn new() -> Self {
        Self {
            remote: SshRemoteSession::new(),
        }
    }

    fn ctl(&mut self, server: &ServerConfig, action: &str) -> Result<()> {
        let command = format!(
            "cd {} && ./bin/reefserver-ctl {action}",
            server.home_dir.display()
        );
        let output = self.remote.execute(&server.host, &command)?;
        if !output.success() {
            return Err(anyhow!(
                "reefserver-ctl {action} failed on {}: {}",
                server.address(),
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}

impl ServiceControl for CtlServiceControl {
    fn start_servers(&mut self, servers: &[ServerConfig], bootstrap: bool) -> Result<()> {
        let action = if bootstrap { "start --bootstrap" } else { "start" };
        for server in servers {
            self.ctl(server, action)?;
        }
        Ok(())
    }

    fn stop_servers(&mut self, servers: &[ServerConfig]) -> Result<()> {
        for server in servers {
            self.ctl(server, "stop")?;
        }
        Ok(())
    }
}

/// Substitutes `?` placeholders with SQL-quoted argument values.
pub fn bind_sql(sql: &str, args: &[SqlValue]) -> Result<String> {
    let mut bound = String::with_capacity(sql.len());
    let mut values = args.iter();
    for ch in sql.chars() {
        if ch != '?' {
            bound.push(ch);
            continue;
        }
        let value = values
            .next()
            .ok_or_else(|| anyhow!("more placeholders than arguments in: {sql}"))?;
        match value {
            SqlValue::Null => bound.push_str("NULL"),
            SqlValue::Int(value) => bound.push_str(&value.to_string()),
            SqlValue::Text(value) => {
                bound.push('\'');
                bound.push_str(&value.replace('\'', "''"));
                bound.push('\'');
            }
        }
    }
    if values.next().is_some() {
        return Err(anyhow!("more arguments than placeholders in: {sql}"));
    }
    Ok(bound)
}

/// Parses the admin client's batch output: a tab-separated header line
/// followed by one line per row. `NULL` is the client's null marker.
pub fn parse_batch_rows(raw: &str) -> Vec<Row> {
    let mut lines = raw.lines().filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns = header.split('\t').collect::<Vec<_>>();

    lines
        .map(|line| {
            let mut row = BTreeMap::new();
            for (column, field) in columns.iter().zip(line.split('\t')) {
                let value = if field == "NULL" {
                    SqlValue::Null
                } else if let Ok(number) = field.parse::<i64>() {
                    SqlValue::Int(number)
                } else {
                    SqlValue::Text(field.to_string())
                };
                row.insert((*column).to_string(), value);
            }
            row
        })
        .collect()
}

/// Administrative SQL over the launcher binary in batch mode.
pub struct BatchSqlSession {
    launcher: PathBuf,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
}

impl BatchSqlSession {
    fn run(&self, sql: &str) -> Result<CommandOutput> {
        let mut command = Command::new(&self.launcher);
        command
            .args(["--batch", "-e", sql])
            .args(["-h", &self.host])
            .args(["-P", &self.port.to_string()])
            .args(["-u", &self.user]);
        if let Some(password) = &self.password {
            command.args(["-p", password]);
        }
        let output = output_of(&mut command)?;
        if !output.success() {
            return Err(anyhow!(
                "admin client failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(output)
    }
}

impl DbSession for BatchSqlSession {
    fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<()> {
        self.run(&bind_sql(sql, args)?).map(drop)
    }

    fn fetch_one(&mut self, sql: &str, args: &[SqlValue]) -> Result<Option<Row>> {
        let mut rows = self.fetch_all(sql, args)?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }

    fn fetch_all(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>> {
        let output = self.run(&bind_sql(sql, args)?)?;
        Ok(parse_batch_rows(&output.stdout))
    }
}

pub struct BatchSqlConnector {
    launcher: PathBuf,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
}

impl BatchSqlConnector {
    pub fn for_cluster(cluster: &ClusterConfig) -> Self {
        let primary = cluster.primary();
        Self {
            launcher: cluster.launcher.clone(),
            host: primary.host.clone(),
            port: primary.sql_port,
            user: cluster.user.clone(),
            password: cluster.password.clone(),
        }
    }
}

impl AdminConnector for BatchSqlConnector {
    fn connect(&mut self) -> Result<Box<dyn DbSession>> {
        let session = BatchSqlSession {
            launcher: self.launcher.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
        };
        // The session is stateless per statement; a probe proves the
        // cluster actually answers before the engine proceeds.
        session.run("SELECT 1")?;
        Ok(Box::new(session))
    }
}
