//! Global runtime configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the unikit runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Base directory for persisted machine, network, and volume records
    /// and per-machine state directories.
    pub runtime_dir: PathBuf,
}

impl RuntimeConfig {
    /// Builds a configuration rooted at an explicit directory.
    #[must_use]
    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Builds the effective configuration: `UNIKIT_RUNTIME_DIR` if set,
    /// otherwise the built-in default.
    #[must_use]
    pub fn from_env() -> Self {
        let runtime_dir = std::env::var_os(constants::RUNTIME_DIR_ENV)
            .map_or_else(|| PathBuf::from(constants::DEFAULT_RUNTIME_DIR), PathBuf::from);
        Self { runtime_dir }
    }

    /// Directory for a store kind, e.g. `machinev1alpha1`.
    #[must_use]
    pub fn kind_dir(&self, kind: &str) -> PathBuf {
        self.runtime_dir.join(kind)
    }

    /// Per-machine state directory for the given UID.
    #[must_use]
    pub fn state_dir(&self, uid: &crate::types::MachineId) -> PathBuf {
        self.runtime_dir.join(uid.to_string())
    }

    /// Directory for host service wrapper metadata.
    #[must_use]
    pub fn systemd_dir(&self) -> PathBuf {
        self.runtime_dir.join(constants::SYSTEMD_DIR)
    }

    /// Returns the runtime directory as a path.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from(constants::DEFAULT_RUNTIME_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_dir_nests_under_runtime_dir() {
        let config = RuntimeConfig::with_runtime_dir("/tmp/unikit-test");
        assert_eq!(
            config.kind_dir(constants::MACHINE_KIND),
            PathBuf::from("/tmp/unikit-test/machinev1alpha1")
        );
    }

    #[test]
    fn state_dir_uses_uid() {
        let config = RuntimeConfig::with_runtime_dir("/tmp/unikit-test");
        let uid = crate::types::MachineId::generate();
        assert_eq!(config.state_dir(&uid), PathBuf::from(format!("/tmp/unikit-test/{uid}")));
    }
}
