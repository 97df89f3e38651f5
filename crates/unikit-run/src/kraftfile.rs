//! The consumed Kraftfile contract.
//!
//! Full Kraftfile parsing (component resolution, KConfig merging, build
//! plans) lives outside this repository. The run pipeline only consumes
//! the application surface: declared targets, the runtime directive, the
//! rootfs source, volumes, environment, and the default command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use unikit_common::error::{Result, UnikitError};

/// File names probed, in order, when looking for a project manifest.
pub const KRAFTFILE_NAMES: [&str; 3] = ["Kraftfile", "kraft.yaml", "kraft.yml"];

/// A build target declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetSpec {
    /// Optional target name used for `--target` selection.
    #[serde(default)]
    pub name: Option<String>,
    /// Target platform string.
    #[serde(alias = "plat")]
    pub platform: String,
    /// Target architecture string.
    #[serde(alias = "arch")]
    pub architecture: String,
}

/// A command that may be written as a string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// Single string, split on whitespace.
    Line(String),
    /// Explicit argument vector.
    Args(Vec<String>),
}

impl Command {
    /// Normalises to an argument vector.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(String::from).collect(),
            Self::Args(args) => args.clone(),
        }
    }
}

/// The application surface of a project manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Application {
    /// Manifest schema version.
    #[serde(default)]
    pub spec: Option<String>,
    /// Project name; the directory name stands in when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// The `unikraft` core section; presence marks a buildable project.
    #[serde(default)]
    pub unikraft: Option<serde_yaml::Value>,
    /// Pre-built runtime package reference.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Root filesystem source: a directory or an archive.
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    /// Default guest command.
    #[serde(default)]
    pub cmd: Option<Command>,
    /// Environment exported to the guest.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Declared build targets.
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    /// `host:guest` volume bindings.
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl Application {
    /// Effective project name for `dir`.
    #[must_use]
    pub fn project_name(&self, dir: &Path) -> String {
        self.name.clone().unwrap_or_else(|| {
            dir.file_name()
                .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned())
        })
    }
}

/// Locates the manifest for a project directory.
///
/// An explicit path wins; otherwise the well-known names are probed in
/// order.
#[must_use]
pub fn find_manifest(dir: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    KRAFTFILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Loads and parses the manifest for a project directory.
///
/// # Errors
///
/// Returns `NotFound` when no manifest exists and `InvalidInput` when it
/// does not parse.
pub fn load(dir: &Path, explicit: Option<&Path>) -> Result<Application> {
    let path = find_manifest(dir, explicit).ok_or_else(|| UnikitError::NotFound {
        kind: "Kraftfile",
        id: dir.display().to_string(),
    })?;
    let contents =
        std::fs::read_to_string(&path).map_err(|e| UnikitError::io(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| UnikitError::InvalidInput {
        message: format!("malformed Kraftfile {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unikraft_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("Kraftfile"),
            r"
spec: v0.6
name: helloworld
unikraft:
  version: stable
targets:
  - plat: qemu
    arch: x86_64
  - name: cloud
    plat: fc
    arch: arm64
",
        )
        .expect("write");

        let app = load(dir.path(), None).expect("load");
        assert!(app.unikraft.is_some());
        assert!(app.runtime.is_none());
        assert_eq!(app.targets.len(), 2);
        assert_eq!(app.targets[0].platform, "qemu");
        assert_eq!(app.targets[1].name.as_deref(), Some("cloud"));
        assert_eq!(app.project_name(dir.path()), "helloworld");
    }

    #[test]
    fn parses_runtime_project_with_string_cmd() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("kraft.yaml"),
            r"
spec: v0.6
runtime: unikraft.org/nginx:latest
rootfs: ./rootfs
cmd: nginx -g 'daemon off;'
env:
  LANG: C
",
        )
        .expect("write");

        let app = load(dir.path(), None).expect("load");
        assert_eq!(app.runtime.as_deref(), Some("unikraft.org/nginx:latest"));
        let cmd = app.cmd.expect("cmd").to_args();
        assert_eq!(cmd[0], "nginx");
        assert_eq!(app.env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            load(dir.path(), None),
            Err(UnikitError::NotFound { .. })
        ));
    }

    #[test]
    fn explicit_manifest_path_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let custom = dir.path().join("Kraftfile.custom");
        std::fs::write(&custom, "spec: v0.6\nruntime: unikraft.org/base:latest\n")
            .expect("write");
        let app = load(dir.path(), Some(&custom)).expect("load");
        assert!(app.runtime.is_some());
    }
}
