//! Raw-kernel strategy: boot a pre-built unikernel binary directly.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Architecture;
use unikit_machine::machine::Machine;

use crate::elf;
use crate::runner::{Prompter, Runner, RunnerOpts};

/// Launches a positional argument that is a Unikraft unikernel image.
pub struct KernelRunner {
    probed: Mutex<Option<(PathBuf, Architecture)>>,
}

impl KernelRunner {
    /// Builds the strategy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            probed: Mutex::new(None),
        }
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, Option<(PathBuf, Architecture)>>> {
        self.probed.lock().map_err(|_| UnikitError::Fatal {
            message: "runner cache poisoned".into(),
        })
    }
}

impl Default for KernelRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for KernelRunner {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn description(&self) -> &'static str {
        "run a unikernel image"
    }

    fn runnable(&self, ctx: &Context, _opts: &RunnerOpts, args: &[String]) -> Result<bool> {
        ctx.check()?;
        let Some(first) = args.first() else {
            return Ok(false);
        };
        let path = Path::new(first);
        if !path.is_file() {
            return Ok(false);
        }
        match elf::detect_unikernel(path)? {
            Some(architecture) => {
                *self.cache()? = Some((path.to_path_buf(), architecture));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn prepare(
        &self,
        ctx: &Context,
        opts: &RunnerOpts,
        _prompter: &dyn Prompter,
        machine: &mut Machine,
        args: &[String],
    ) -> Result<()> {
        ctx.check()?;
        let cached = self.cache()?.clone();
        let (path, detected) = match cached {
            Some(found) => found,
            None => {
                let path = args.first().map(PathBuf::from).ok_or_else(|| {
                    UnikitError::InvalidInput {
                        message: "no kernel argument given".into(),
                    }
                })?;
                let architecture =
                    elf::detect_unikernel(&path)?.ok_or_else(|| UnikitError::InvalidInput {
                        message: format!("{} is not a unikernel image", path.display()),
                    })?;
                (path, architecture)
            }
        };

        let basename = path
            .file_name()
            .map_or_else(|| "kernel".to_string(), |n| n.to_string_lossy().into_owned());
        machine.spec.kernel = format!("kernel://{basename}");
        machine.spec.architecture = opts.architecture.unwrap_or(detected);
        machine.spec.application_args = args.get(1..).unwrap_or_default().to_vec();
        machine.status.kernel_path =
            Some(path.canonicalize().map_err(|e| UnikitError::io(&path, e))?);
        tracing::debug!(kernel = %machine.spec.kernel, arch = %machine.spec.architecture, "raw kernel prepared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use object::elf::{EM_AARCH64, EM_X86_64};

    use crate::elf::testelf;
    use crate::runner::NoPrompter;

    use super::*;

    fn write_kernel(dir: &Path, name: &str, e_machine: u16) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, testelf::unikraft_kernel(e_machine)).expect("fixture");
        path
    }

    #[test]
    fn accepts_unikernel_and_wires_machine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = write_kernel(dir.path(), "hello_qemu-x86_64", EM_X86_64);
        let runner = KernelRunner::new();
        let ctx = Context::background();
        let opts = RunnerOpts::default();
        let args = vec![
            kernel.display().to_string(),
            "--".into(),
            "hello".into(),
        ];

        assert!(runner.runnable(&ctx, &opts, &args).expect("probe"));

        let mut machine = Machine::new("probe");
        runner
            .prepare(&ctx, &opts, &NoPrompter, &mut machine, &args)
            .expect("prepare");
        assert_eq!(machine.spec.kernel, "kernel://hello_qemu-x86_64");
        assert_eq!(machine.spec.architecture, Architecture::X86_64);
        assert_eq!(machine.spec.application_args, vec!["--", "hello"]);
        assert!(machine.status.kernel_path.expect("kernel path").is_file());
    }

    #[test]
    fn architecture_flag_overrides_detection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = write_kernel(dir.path(), "hello_qemu-arm64", EM_AARCH64);
        let runner = KernelRunner::new();
        let ctx = Context::background();
        let opts = RunnerOpts {
            architecture: Some(Architecture::Arm64),
            ..RunnerOpts::default()
        };
        let args = vec![kernel.display().to_string()];
        assert!(runner.runnable(&ctx, &opts, &args).expect("probe"));

        let mut machine = Machine::new("probe");
        runner
            .prepare(&ctx, &opts, &NoPrompter, &mut machine, &args)
            .expect("prepare");
        assert_eq!(machine.spec.architecture, Architecture::Arm64);
    }

    #[test]
    fn rejects_missing_and_non_kernel_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = KernelRunner::new();
        let ctx = Context::background();
        let opts = RunnerOpts::default();

        assert!(!runner
            .runnable(&ctx, &opts, &["/nonexistent".to_string()])
            .expect("probe"));

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"not an elf").expect("fixture");
        assert!(!runner
            .runnable(&ctx, &opts, &[text.display().to_string()])
            .expect("probe"));

        assert!(!runner.runnable(&ctx, &opts, &[]).expect("probe"));
    }
}
