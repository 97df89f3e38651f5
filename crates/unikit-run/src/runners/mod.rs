//! The five runner strategies.

pub mod kernel;
pub mod kraftfile_runtime;
pub mod kraftfile_unikraft;
pub mod linuxu;
pub mod package;

use std::sync::Arc;

use unikit_common::error::{Result, UnikitError};
use unikit_common::types::{Architecture, Platform};
use unikit_pack::{Package, PackageManager};

use crate::runner::{Prompter, Runner};

/// The strategies in probe order.
#[must_use]
pub fn default_runners(manager: Arc<dyn PackageManager>) -> Vec<Box<dyn Runner>> {
    vec![
        Box::new(linuxu::LinuxuRunner::new(Arc::clone(&manager))),
        Box::new(kernel::KernelRunner::new()),
        Box::new(kraftfile_unikraft::KraftfileUnikraftRunner::new()),
        Box::new(kraftfile_runtime::KraftfileRuntimeRunner::new(Arc::clone(&manager))),
        Box::new(package::PackageRunner::new(manager)),
    ]
}

/// Narrows a candidate list to one package.
///
/// Exact architecture/platform matches are preferred; a single survivor is
/// taken without prompting, several survivors prompt (or fail when
/// prompting is disabled).
pub(crate) fn select_package(
    prompter: &dyn Prompter,
    allow_prompt: bool,
    subject: &str,
    packages: Vec<Arc<dyn Package>>,
    architecture: Option<Architecture>,
    platform: Option<Platform>,
) -> Result<Arc<dyn Package>> {
    let mut packages = packages;
    if packages.len() == 1 {
        return Ok(packages.remove(0));
    }

    let exact: Vec<Arc<dyn Package>> = packages
        .iter()
        .filter(|p| {
            architecture.is_none_or(|a| p.architecture() == Some(a))
                && platform.is_none_or(|pl| p.platform() == Some(pl))
        })
        .cloned()
        .collect();
    let mut pool = if exact.is_empty() { packages } else { exact };

    if pool.len() == 1 {
        return Ok(pool.remove(0));
    }
    if !allow_prompt {
        return Err(UnikitError::InvalidInput {
            message: format!(
                "several packages provide {subject}: {}",
                pool.iter()
                    .map(|p| p.reference())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });
    }
    let options: Vec<String> = pool.iter().map(|p| p.reference()).collect();
    let index = prompter.select(subject, &options)?;
    if index >= pool.len() {
        return Err(UnikitError::InvalidInput {
            message: format!("selection {index} out of range"),
        });
    }
    Ok(pool.remove(index))
}
