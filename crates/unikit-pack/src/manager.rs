//! The `PackageManager` and `Package` contracts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use unikit_common::ctx::Context;
use unikit_common::error::Result;
use unikit_common::types::{Architecture, Platform};

/// Filter set for catalog queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Package name, e.g. `unikraft.org/nginx`.
    pub name: Option<String>,
    /// Version or tag, e.g. `latest`.
    pub version: Option<String>,
    /// Required guest architecture.
    pub architecture: Option<Architecture>,
    /// Required platform.
    pub platform: Option<Platform>,
    /// Required KConfig options.
    pub kconfig: Vec<String>,
    /// Whether remote catalogs may be consulted.
    pub remote: bool,
    /// Whether remote catalogs must be refreshed first.
    pub update: bool,
}

impl Query {
    /// Builds a query for a `name[:version]` reference.
    #[must_use]
    pub fn for_reference(reference: &str) -> Self {
        let (name, version) = match reference.rsplit_once(':') {
            Some((name, version)) if !version.contains('/') => {
                (name.to_string(), Some(version.to_string()))
            }
            _ => (reference.to_string(), None),
        };
        Self {
            name: Some(name),
            version,
            ..Self::default()
        }
    }

    /// Restricts results to `architecture`.
    #[must_use]
    pub fn with_architecture(mut self, architecture: Option<Architecture>) -> Self {
        self.architecture = architecture;
        self
    }

    /// Restricts results to `platform`.
    #[must_use]
    pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// Allows remote catalogs.
    #[must_use]
    pub const fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Forces a remote catalog refresh.
    #[must_use]
    pub const fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }
}

/// Options for materialising a package on disk.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Directory the package contents are pulled into.
    pub workdir: PathBuf,
}

impl PullOptions {
    /// Pull into `workdir`.
    #[must_use]
    pub fn into_dir(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

/// A resolved package: a unikernel image plus its boot metadata.
///
/// Path accessors return `None` until [`Package::pull`] has materialised
/// the package.
pub trait Package: Send + Sync {
    /// Package name, e.g. `unikraft.org/nginx`.
    fn name(&self) -> &str;

    /// Version or tag.
    fn version(&self) -> &str;

    /// Provider format, e.g. `oci`; used as the kernel URI scheme.
    fn format(&self) -> &str;

    /// `name:version` reference.
    fn reference(&self) -> String {
        format!("{}:{}", self.name(), self.version())
    }

    /// Architecture the kernel was built for, when known.
    fn architecture(&self) -> Option<Architecture>;

    /// Platform the kernel was built for, when known.
    fn platform(&self) -> Option<Platform>;

    /// Host path of the pulled kernel image.
    fn kernel(&self) -> Option<PathBuf>;

    /// Host path of the pulled kernel with debug symbols, if shipped.
    fn kernel_dbg(&self) -> Option<PathBuf>;

    /// Host path of the pulled initramfs, if shipped.
    fn initrd(&self) -> Option<PathBuf>;

    /// Host path of a pulled archive artifact that still needs unpacking,
    /// if the provider ships one.
    fn artifact(&self) -> Option<PathBuf> {
        None
    }

    /// KConfig options the kernel was built with.
    fn kconfig(&self) -> BTreeMap<String, String>;

    /// Default guest command.
    fn command(&self) -> Vec<String>;

    /// Free-form provider metadata.
    fn metadata(&self) -> BTreeMap<String, String>;

    /// Materialises the package contents under `opts.workdir`.
    ///
    /// # Errors
    ///
    /// Returns a transient I/O error when the pull can be retried.
    fn pull(&self, ctx: &Context, opts: &PullOptions) -> Result<()>;
}

/// A catalog of packages across local and remote registries.
pub trait PackageManager: Send + Sync {
    /// Refreshes remote catalog indices.
    ///
    /// # Errors
    ///
    /// Returns a transient I/O error when the refresh can be retried.
    fn update(&self, ctx: &Context) -> Result<()>;

    /// Returns every package matching `query`.
    ///
    /// # Errors
    ///
    /// Returns a transient I/O error for registry failures.
    fn catalog(&self, ctx: &Context, query: &Query) -> Result<Vec<Arc<dyn Package>>>;

    /// Whether `reference` names something this manager could resolve.
    ///
    /// # Errors
    ///
    /// Returns a transient I/O error for registry failures.
    fn is_compatible(&self, ctx: &Context, reference: &str, query: &Query) -> Result<bool>;
}

/// Queries the catalog locally first, then retries once against remote
/// catalogs with an index update.
///
/// An empty local result and a transient local failure are treated the
/// same way; a failure of the remote retry surfaces.
///
/// # Errors
///
/// Returns the remote attempt's error when both attempts fail.
pub fn find_packages(
    manager: &dyn PackageManager,
    ctx: &Context,
    query: &Query,
) -> Result<Vec<Arc<dyn Package>>> {
    let local = query.clone().with_remote(false).with_update(false);
    match manager.catalog(ctx, &local) {
        Ok(packages) if !packages.is_empty() => return Ok(packages),
        Ok(_) => {
            tracing::debug!(name = ?query.name, "local catalog empty, consulting remote");
        }
        Err(e) if e.is_transient() => {
            tracing::warn!(name = ?query.name, error = %e, "local catalog failed, consulting remote");
        }
        Err(e) => return Err(e),
    }

    ctx.check()?;
    let remote = query.clone().with_remote(true).with_update(true);
    manager.catalog(ctx, &remote)
}

/// A package manager with an empty catalog.
///
/// Stands in when no provider is wired up; every lookup politely reports
/// nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPackageManager;

impl PackageManager for NullPackageManager {
    fn update(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    fn catalog(&self, _ctx: &Context, _query: &Query) -> Result<Vec<Arc<dyn Package>>> {
        Ok(Vec::new())
    }

    fn is_compatible(&self, _ctx: &Context, _reference: &str, _query: &Query) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use unikit_common::error::UnikitError;

    use super::*;

    #[test]
    fn query_reference_splits_version() {
        let query = Query::for_reference("unikraft.org/nginx:latest");
        assert_eq!(query.name.as_deref(), Some("unikraft.org/nginx"));
        assert_eq!(query.version.as_deref(), Some("latest"));
    }

    #[test]
    fn query_reference_without_version() {
        let query = Query::for_reference("unikraft.org/nginx");
        assert_eq!(query.name.as_deref(), Some("unikraft.org/nginx"));
        assert!(query.version.is_none());
    }

    #[test]
    fn query_reference_with_port_in_registry() {
        // The colon belongs to the registry host, not a version tag.
        let query = Query::for_reference("localhost:5000/app");
        assert_eq!(query.name.as_deref(), Some("localhost:5000/app"));
        assert!(query.version.is_none());
    }

    struct RecordingManager {
        queries: Mutex<Vec<Query>>,
        local_fails_transiently: bool,
    }

    impl PackageManager for RecordingManager {
        fn update(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }

        fn catalog(&self, _ctx: &Context, query: &Query) -> Result<Vec<Arc<dyn Package>>> {
            self.queries
                .lock()
                .map_err(|_| UnikitError::Fatal {
                    message: "lock".into(),
                })?
                .push(query.clone());
            if !query.remote && self.local_fails_transiently {
                return Err(UnikitError::TransientIo {
                    message: "index unreadable".into(),
                });
            }
            Ok(Vec::new())
        }

        fn is_compatible(&self, _ctx: &Context, _reference: &str, _query: &Query) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn find_packages_falls_back_to_remote_update() {
        let manager = RecordingManager {
            queries: Mutex::new(Vec::new()),
            local_fails_transiently: false,
        };
        let query = Query::for_reference("unikraft.org/nginx:latest");
        let _ = find_packages(&manager, &Context::background(), &query).expect("query");

        let queries = manager.queries.lock().expect("lock");
        assert_eq!(queries.len(), 2);
        assert!(!queries[0].remote);
        assert!(queries[1].remote && queries[1].update);
    }

    #[test]
    fn find_packages_retries_after_transient_local_failure() {
        let manager = RecordingManager {
            queries: Mutex::new(Vec::new()),
            local_fails_transiently: true,
        };
        let query = Query::for_reference("unikraft.org/nginx");
        let _ = find_packages(&manager, &Context::background(), &query).expect("query");
        assert_eq!(manager.queries.lock().expect("lock").len(), 2);
    }

    #[test]
    fn null_manager_is_empty_and_incompatible() {
        let ctx = Context::background();
        let manager = NullPackageManager;
        assert!(manager.catalog(&ctx, &Query::default()).expect("catalog").is_empty());
        assert!(!manager
            .is_compatible(&ctx, "anything", &Query::default())
            .expect("compat"));
    }
}
