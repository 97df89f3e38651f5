//! Package strategy: resolve a registry reference and boot its kernel.

use std::path::Path;
use std::sync::{Arc, Mutex};

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Architecture;
use unikit_machine::machine::Machine;
use unikit_pack::{PackageManager, PullOptions, Query, archive, find_packages};

use crate::runner::{Prompter, Runner, RunnerOpts};
use crate::runners::select_package;

/// Launches a package reference such as `unikraft.org/nginx:latest`.
pub struct PackageRunner {
    manager: Arc<dyn PackageManager>,
    probed: Mutex<Option<String>>,
}

impl PackageRunner {
    /// Builds the strategy over the given package manager.
    #[must_use]
    pub fn new(manager: Arc<dyn PackageManager>) -> Self {
        Self {
            manager,
            probed: Mutex::new(None),
        }
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
        self.probed.lock().map_err(|_| UnikitError::Fatal {
            message: "runner cache poisoned".into(),
        })
    }
}

impl Runner for PackageRunner {
    fn name(&self) -> &'static str {
        "package"
    }

    fn description(&self) -> &'static str {
        "pull and run a unikernel package"
    }

    fn runnable(&self, ctx: &Context, opts: &RunnerOpts, args: &[String]) -> Result<bool> {
        ctx.check()?;
        let Some(reference) = args.first() else {
            return Ok(false);
        };
        // Anything that exists on disk belongs to the file-based
        // strategies.
        if reference.is_empty() || Path::new(reference).exists() {
            return Ok(false);
        }
        let query = Query::for_reference(reference)
            .with_architecture(opts.architecture)
            .with_platform(opts.platform)
            .with_remote(true);
        if self.manager.is_compatible(ctx, reference, &query)? {
            *self.cache()? = Some(reference.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn prepare(
        &self,
        ctx: &Context,
        opts: &RunnerOpts,
        prompter: &dyn Prompter,
        machine: &mut Machine,
        args: &[String],
    ) -> Result<()> {
        ctx.check()?;
        let reference = match self.cache()?.clone() {
            Some(reference) => reference,
            None => args
                .first()
                .cloned()
                .ok_or_else(|| UnikitError::InvalidInput {
                    message: "no package reference given".into(),
                })?,
        };

        let architecture = opts.architecture.or_else(Architecture::host);
        let query = Query::for_reference(&reference)
            .with_architecture(architecture)
            .with_platform(opts.platform);
        let packages = find_packages(self.manager.as_ref(), ctx, &query)?;
        if packages.is_empty() {
            return Err(UnikitError::NotFound {
                kind: "package",
                id: reference,
            });
        }
        let package = select_package(
            prompter,
            opts.allow_prompt,
            &reference,
            packages,
            architecture,
            opts.platform,
        )?;

        // The package lands in the machine's staging directory so created
        // machines keep their artifacts next to their state.
        package.pull(ctx, &PullOptions::into_dir(&opts.stage_dir))?;
        if let Some(artifact) = package.artifact() {
            archive::unpack(ctx, &artifact, &opts.stage_dir.join("unpacked"))?;
        }
        let kernel_path = package.kernel().ok_or_else(|| UnikitError::NotFound {
            kind: "kernel",
            id: package.reference(),
        })?;

        machine.spec.kernel = format!("{}://{}", package.format(), package.reference());
        machine.status.kernel_path = Some(kernel_path);
        machine.status.initrd_path = package.initrd();
        if let Some(architecture) = package.architecture().or(architecture) {
            machine.spec.architecture = architecture;
        }
        if let Some(platform) = package.platform() {
            machine.spec.platform = platform;
        }
        let trailing = args.get(1..).unwrap_or_default().to_vec();
        machine.spec.application_args = if trailing.is_empty() {
            package.command()
        } else {
            trailing
        };
        tracing::debug!(package = %package.reference(), "package machine prepared");
        Ok(())
    }
}
