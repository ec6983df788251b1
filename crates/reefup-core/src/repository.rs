use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Metadata shipped inside every installed repository as `repository.toml`.
///
/// `require_from_binary` marks versions that cannot be reached by running
/// migration scripts alone: upgrading into them needs an actual binary swap.
/// `direct_upgrade` marks versions whose migration scripts live in the
/// `scripts-direct` set instead of `scripts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryManifest {
    pub name: String,
    pub version: Version,
    pub hash: String,
    #[serde(default)]
    pub require_from_binary: bool,
    #[serde(default)]
    pub direct_upgrade: bool,
}

impl RepositoryManifest {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(input).context("failed to parse repository manifest")?;
        if manifest.name.trim().is_empty() {
            return Err(anyhow!("repository manifest name must not be empty"));
        }
        if manifest.hash.trim().is_empty() {
            return Err(anyhow!(
                "repository manifest '{}' has an empty content hash",
                manifest.name
            ));
        }
        Ok(manifest)
    }
}

/// One installed version of a ReefDB component on local disk.
///
/// The layout under `root` is fixed by the install subsystem: `bin/` and
/// `lib/` hold the binaries, `scripts/` and `scripts-direct/` hold the two
/// migration-script sets. Immutable once installed; this crate only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareRepository {
    pub name: String,
    pub version: Version,
    pub hash: String,
    pub root: PathBuf,
    pub require_from_binary: bool,
    pub direct_upgrade: bool,
}

impl SoftwareRepository {
    pub fn from_manifest(manifest: RepositoryManifest, root: impl Into<PathBuf>) -> Self {
        Self {
            name: manifest.name,
            version: manifest.version,
            hash: manifest.hash,
            root: root.into(),
            require_from_binary: manifest.require_from_binary,
            direct_upgrade: manifest.direct_upgrade,
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn script_dir(&self, direct_upgrade: bool) -> PathBuf {
        if direct_upgrade {
            self.root.join("scripts-direct")
        } else {
            self.root.join("scripts")
        }
    }
}

/// Read-only view over the local install root.
///
/// Layout: `<root>/<component>/<version>/repository.toml` next to the
/// version's `bin`, `lib` and script directories.
#[derive(Debug, Clone)]
pub struct RepositoryStore {
    root: PathBuf,
}

impl RepositoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All installed versions of one component, sorted ascending.
    pub fn installed_versions(&self, component: &str) -> Result<Vec<SoftwareRepository>> {
        let dir = self.root.join(component);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read install root: {}", dir.display()));
            }
        };

        let mut repositories = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let version_root = entry.path();
            let manifest_path = version_root.join("repository.toml");
            if !manifest_path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&manifest_path).with_context(|| {
                format!("failed to read repository manifest: {}", manifest_path.display())
            })?;
            let manifest = RepositoryManifest::from_toml_str(&raw).with_context(|| {
                format!("invalid repository manifest: {}", manifest_path.display())
            })?;
            if manifest.name != component {
                return Err(anyhow!(
                    "repository manifest under '{}' names component '{}'",
                    version_root.display(),
                    manifest.name
                ));
            }
            repositories.push(SoftwareRepository::from_manifest(manifest, version_root));
        }

        repositories.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(repositories)
    }

    pub fn get(&self, component: &str, version: &Version) -> Result<Option<SoftwareRepository>> {
        Ok(self
            .installed_versions(component)?
            .into_iter()
            .find(|repository| &repository.version == version))
    }

    /// The ordered chain of installed repositories from the running version
    /// through the requested target, both inclusive. Input to route planning.
    pub fn upgrade_chain(
        &self,
        component: &str,
        current: &Version,
        target: &Version,
    ) -> Result<Vec<SoftwareRepository>> {
        if target <= current {
            return Err(anyhow!(
                "target version {target} is not newer than running version {current}"
            ));
        }

        let installed = self.installed_versions(component)?;
        let chain = installed
            .into_iter()
            .filter(|repository| {
                &repository.version >= current && &repository.version <= target
            })
            .collect::<Vec<_>>();

        match chain.first() {
            Some(first) if &first.version == current => {}
            _ => {
                return Err(anyhow!(
                    "running version {current} of '{component}' is not installed"
                ));
            }
        }
        match chain.last() {
            Some(last) if &last.version == target => {}
            _ => {
                return Err(anyhow!(
                    "target version {target} of '{component}' is not installed"
                ));
            }
        }

        Ok(chain)
    }
}
