//! Linux-userspace strategy: host a dynamic PIE executable under the
//! Unikraft Linux-ABI loader.

use std::path::PathBuf;
use std::sync::Arc;

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Architecture;
use unikit_machine::machine::Machine;
use unikit_pack::{PackageManager, PullOptions, Query, find_packages};

use crate::elf;
use crate::runner::{Prompter, Runner, RunnerOpts};
use crate::runners::select_package;

/// Default loader image pulled when `--runtime` does not override it.
pub const DEFAULT_LOADER: &str = "unikraft.org/elfloader:latest";

/// Launches an ordinary Linux PIE executable inside a unikernel.
pub struct LinuxuRunner {
    manager: Arc<dyn PackageManager>,
}

impl LinuxuRunner {
    /// Builds the strategy over the given package manager.
    #[must_use]
    pub fn new(manager: Arc<dyn PackageManager>) -> Self {
        Self { manager }
    }
}

impl Runner for LinuxuRunner {
    fn name(&self) -> &'static str {
        "linuxu"
    }

    fn description(&self) -> &'static str {
        "run a Linux userspace executable through the Linux-ABI loader"
    }

    fn runnable(&self, ctx: &Context, _opts: &RunnerOpts, args: &[String]) -> Result<bool> {
        ctx.check()?;
        let Some(first) = args.first() else {
            return Ok(false);
        };
        let path = std::path::Path::new(first);
        if !path.is_file() {
            return Ok(false);
        }
        elf::is_dynamic_pie_executable(path)
    }

    fn prepare(
        &self,
        ctx: &Context,
        opts: &RunnerOpts,
        prompter: &dyn Prompter,
        machine: &mut Machine,
        args: &[String],
    ) -> Result<()> {
        let executable = args
            .first()
            .map(PathBuf::from)
            .ok_or_else(|| UnikitError::InvalidInput {
                message: "no executable argument given".into(),
            })?;
        let executable = executable
            .canonicalize()
            .map_err(|e| UnikitError::io(&executable, e))?;

        let architecture = opts
            .architecture
            .or_else(|| {
                std::fs::read(&executable)
                    .ok()
                    .and_then(|data| elf::architecture_of(&data))
            })
            .or_else(Architecture::host)
            .unwrap_or(Architecture::X86_64);

        let reference = opts.runtime.clone().unwrap_or_else(|| DEFAULT_LOADER.to_string());
        let query = Query::for_reference(&reference)
            .with_architecture(Some(architecture))
            .with_platform(opts.platform);
        let packages = find_packages(self.manager.as_ref(), ctx, &query)?;
        if packages.is_empty() {
            return Err(UnikitError::NotFound {
                kind: "package",
                id: reference,
            });
        }
        let loader = select_package(
            prompter,
            opts.allow_prompt,
            &reference,
            packages,
            Some(architecture),
            opts.platform,
        )?;

        loader.pull(ctx, &PullOptions::into_dir(&opts.stage_dir))?;
        let kernel_path = loader.kernel().ok_or_else(|| UnikitError::NotFound {
            kind: "kernel",
            id: loader.reference(),
        })?;

        machine.spec.kernel = format!("elfloader://{}", loader.reference());
        machine.spec.architecture = architecture;
        // The original executable rides into the guest as the initramfs.
        machine.status.initrd_path = Some(executable);
        machine.status.kernel_path = Some(kernel_path);
        machine.spec.application_args = args.get(1..).unwrap_or_default().to_vec();
        tracing::debug!(loader = %loader.reference(), "Linux userspace machine prepared");
        Ok(())
    }
}
