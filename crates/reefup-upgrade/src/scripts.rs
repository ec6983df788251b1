//! Migration-script staging and execution.
//!
//! Scripts travel inside the target software repository. Before a stage
//! runs them, the repository's selected script set is copied once to a
//! deterministic local staging directory keyed by the cluster identity and
//! the repository's content hash; later calls for the same repository reuse
//! the staged copy. The named script is then run through the fixed-protocol
//! launcher, which connects to the cluster and performs whatever the script
//! encodes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use reefup_core::{ServerConfig, SoftwareRepository};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::session::CommandOutput;

/// Connection parameters handed to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Executed,
    Skipped,
}

/// Runs a staged script against the cluster. The production launcher spawns
/// a local process; tests substitute a recording implementation.
pub trait ScriptLauncher {
    fn launch(&mut self, script: &Path, params: &ConnectParams) -> Result<CommandOutput>;
}

/// Invokes `<launcher> <script-path> -h <host> -P <port> -u <user>
/// [-p <password>]`; exit code 0 is success.
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    launcher: PathBuf,
}

impl LocalLauncher {
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
        }
    }
}

impl ScriptLauncher for LocalLauncher {
    fn launch(&mut self, script: &Path, params: &ConnectParams) -> Result<CommandOutput> {
        let mut command = Command::new(&self.launcher);
        command
            .arg(script)
            .args(["-h", &params.host])
            .args(["-P", &params.port.to_string()])
            .args(["-u", &params.user]);
        if let Some(password) = &params.password {
            command.args(["-p", password]);
        }

        let output = command.output().with_context(|| {
            format!(
                "failed to spawn script launcher: {}",
                self.launcher.display()
            )
        })?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Where staged script sets live on local disk.
///
/// The cluster key is derived from the set of server addresses under
/// upgrade, so two clusters administered from the same host never share a
/// staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    root: PathBuf,
    cluster_key: String,
}

impl StagingLayout {
    pub fn new(staging_root: Option<&Path>, servers: &[ServerConfig]) -> Self {
        let root = staging_root
            .map(Path::to_path_buf)
            .unwrap_or_else(env::temp_dir);
        Self {
            root,
            cluster_key: cluster_key(servers),
        }
    }

    pub fn cluster_key(&self) -> &str {
        &self.cluster_key
    }

    pub fn cluster_dir(&self) -> PathBuf {
        self.root.join(format!("reefup-{}", self.cluster_key))
    }

    pub fn stage_dir(&self, repository: &SoftwareRepository, direct_upgrade: bool) -> PathBuf {
        let suffix = if direct_upgrade { "-direct" } else { "" };
        self.cluster_dir()
            .join(format!("{}{}", repository.hash, suffix))
    }
}

fn cluster_key(servers: &[ServerConfig]) -> String {
    let mut addresses = servers
        .iter()
        .map(ServerConfig::address)
        .collect::<Vec<_>>();
    addresses.sort();

    let mut hasher = Sha256::new();
    for address in &addresses {
        hasher.update(address.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

pub struct ScriptExecutor {
    layout: StagingLayout,
    launcher: Box<dyn ScriptLauncher>,
    params: ConnectParams,
}

impl ScriptExecutor {
    pub fn new(
        layout: StagingLayout,
        launcher: Box<dyn ScriptLauncher>,
        params: ConnectParams,
    ) -> Self {
        Self {
            layout,
            launcher,
            params,
        }
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Stages the repository's script set if needed and runs the named
    /// script through the launcher.
    ///
    /// A missing script is a skip when `can_skip` is set (a version with no
    /// migration work simply ships none) and an error otherwise.
    pub fn exec_script(
        &mut self,
        name: &str,
        repository: &SoftwareRepository,
        direct_upgrade: bool,
        can_skip: bool,
    ) -> Result<ScriptOutcome> {
        let params = self.params.clone();
        self.exec_script_on(name, repository, direct_upgrade, can_skip, &params)
    }

    /// Same as [`exec_script`](Self::exec_script) but connecting somewhere
    /// other than the default administrative endpoint (per-zone health
    /// checks point at the zone just rolled).
    pub fn exec_script_on(
        &mut self,
        name: &str,
        repository: &SoftwareRepository,
        direct_upgrade: bool,
        can_skip: bool,
        params: &ConnectParams,
    ) -> Result<ScriptOutcome> {
        let staged = self.stage(repository, direct_upgrade)?;
        let script = staged.join(name);
        if !script.exists() {
            if can_skip {
                debug!(
                    script = name,
                    version = %repository.version,
                    "script not shipped, skipping"
                );
                return Ok(ScriptOutcome::Skipped);
            }
            return Err(anyhow!(
                "script '{name}' not found for version {} (looked in {})",
                repository.version,
                staged.display()
            ));
        }

        info!(script = name, version = %repository.version, "running migration script");
        let output = self.launcher.launch(&script, params)?;
        if !output.success() {
            return Err(anyhow!(
                "script '{name}' for version {} failed with exit code {}: {}",
                repository.version,
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(ScriptOutcome::Executed)
    }

    /// Copies the selected script set into the staging directory. Reuses an
    /// existing staged copy without re-copying.
    fn stage(&self, repository: &SoftwareRepository, direct_upgrade: bool) -> Result<PathBuf> {
        let staged = self.layout.stage_dir(repository, direct_upgrade);
        if staged.exists() {
            return Ok(staged);
        }

        let source = repository.script_dir(direct_upgrade);
        if source.exists() {
            copy_dir_recursive(&source, &staged).with_context(|| {
                format!(
                    "failed to stage scripts for version {}",
                    repository.version
                )
            })?;
        } else {
            // Repository ships no scripts of this kind; an empty staged
            // directory still marks it as staged.
            fs::create_dir_all(&staged)
                .with_context(|| format!("failed to create {}", staged.display()))?;
        }
        Ok(staged)
    }

    /// Deletes every staged script set for this cluster. Called once the
    /// binary stage completes.
    pub fn clear_staged(&self) -> Result<()> {
        let dir = self.layout.cluster_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear staged scripts: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
        }
    }
    Ok(())
}
