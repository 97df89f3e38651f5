//! Project strategy: boot a target already built from a Kraftfile's
//! `unikraft` section.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Platform;
use unikit_machine::machine::Machine;
use unikit_resources::volume::{Volume, VolumeSpec, VolumeStatus, parse_volume_binding};

use crate::kraftfile::{self, Application, TargetSpec};
use crate::runner::{Prompter, Runner, RunnerOpts};

/// Launches the compiled artifacts of a unikraft project directory.
pub struct KraftfileUnikraftRunner {
    parsed: Mutex<Option<(PathBuf, Application)>>,
}

/// A declared target together with its compiled kernel image.
#[derive(Debug, Clone)]
struct BuiltTarget {
    target: TargetSpec,
    kernel: PathBuf,
}

impl KraftfileUnikraftRunner {
    /// Builds the strategy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parsed: Mutex::new(None),
        }
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, Option<(PathBuf, Application)>>> {
        self.parsed.lock().map_err(|_| UnikitError::Fatal {
            message: "runner cache poisoned".into(),
        })
    }

    fn load(&self, opts: &RunnerOpts, args: &[String]) -> Result<Option<(PathBuf, Application)>> {
        if let Some(cached) = self.cache()?.clone() {
            return Ok(Some(cached));
        }
        let dir = project_dir(opts, args);
        if kraftfile::find_manifest(&dir, opts.kraftfile.as_deref()).is_none() {
            return Ok(None);
        }
        let app = kraftfile::load(&dir, opts.kraftfile.as_deref())?;
        let entry = (dir, app);
        *self.cache()? = Some(entry.clone());
        Ok(Some(entry))
    }
}

impl Default for KraftfileUnikraftRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for KraftfileUnikraftRunner {
    fn name(&self) -> &'static str {
        "kraftfile-unikraft"
    }

    fn description(&self) -> &'static str {
        "run the cwd's Kraftfile unikraft project"
    }

    fn runnable(&self, ctx: &Context, opts: &RunnerOpts, args: &[String]) -> Result<bool> {
        ctx.check()?;
        Ok(self
            .load(opts, args)?
            .is_some_and(|(_, app)| app.unikraft.is_some()))
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
        let (dir, app) = self.load(opts, args)?.ok_or_else(|| UnikitError::NotFound {
            kind: "Kraftfile",
            id: opts.workdir.display().to_string(),
        })?;
        let app_name = app.project_name(&dir);

        let built = enumerate_built(&dir, &app_name, &app.targets, opts);
        let chosen = match built.len() {
            0 => {
                return Err(UnikitError::NotFound {
                    kind: "built target",
                    id: format!("{} (build the project first)", dir.display()),
                });
            }
            // A single surviving target is taken without prompting even
            // when filters were supplied.
            1 => built.into_iter().next(),
            _ => {
                if !opts.allow_prompt {
                    return Err(UnikitError::InvalidInput {
                        message: format!(
                            "several targets are built, use --target to choose: {}",
                            built.iter().map(describe).collect::<Vec<_>>().join(", ")
                        ),
                    });
                }
                let options: Vec<String> = built.iter().map(describe).collect();
                let index = prompter.select("target", &options)?;
                built.into_iter().nth(index)
            }
        }
        .ok_or_else(|| UnikitError::InvalidInput {
            message: "target selection out of range".into(),
        })?;

        machine.spec.architecture = chosen.target.architecture.parse()?;
        machine.spec.platform = chosen.target.platform.parse()?;
        machine.spec.kernel = format!(
            "project://{app_name}:{}",
            chosen
                .target
                .name
                .clone()
                .unwrap_or_else(|| format!(
                    "{}-{}",
                    chosen.target.platform, chosen.target.architecture
                ))
        );
        machine.status.kernel_path = Some(chosen.kernel);

        let app_args = args_after_dir(args, &dir);
        machine.spec.application_args = if app_args.is_empty() {
            app.cmd.as_ref().map(kraftfile::Command::to_args).unwrap_or_default()
        } else {
            app_args
        };

        for (key, value) in &app.env {
            let _ = machine
                .spec
                .env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if machine.spec.rootfs.is_none() {
            machine.spec.rootfs = app.rootfs.as_ref().map(|r| absolute_in(&dir, r));
        }
        append_manifest_volumes(machine, &dir, &app.volumes)?;
        tracing::debug!(kernel = %machine.spec.kernel, "project target prepared");
        Ok(())
    }
}

/// Resolves which directory the invocation points at.
fn project_dir(opts: &RunnerOpts, args: &[String]) -> PathBuf {
    match args.first() {
        Some(first) if Path::new(first).is_dir() => PathBuf::from(first),
        _ => opts.workdir.clone(),
    }
}

/// Positional arguments after the optional project directory become the
/// application arguments.
fn args_after_dir(args: &[String], dir: &Path) -> Vec<String> {
    match args.first() {
        Some(first) if Path::new(first) == dir => args[1..].to_vec(),
        _ => args.to_vec(),
    }
}

fn absolute_in(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn describe(built: &BuiltTarget) -> String {
    built.target.name.clone().unwrap_or_else(|| {
        format!("{}-{}", built.target.platform, built.target.architecture)
    })
}

/// Filters declared targets by the requested name/arch/platform and keeps
/// only those whose kernel image exists on disk.
fn enumerate_built(
    dir: &Path,
    app_name: &str,
    targets: &[TargetSpec],
    opts: &RunnerOpts,
) -> Vec<BuiltTarget> {
    let build_dirs = [dir.join(".unikraft").join("build"), dir.join("build")];
    let mut built = Vec::new();
    for target in targets {
        if let Some(wanted) = &opts.target {
            if target.name.as_deref() != Some(wanted.as_str()) {
                continue;
            }
        }
        if let Some(architecture) = opts.architecture {
            if target.architecture != architecture.to_string() {
                continue;
            }
        }
        if let Some(platform) = opts.platform {
            match target.platform.parse::<Platform>() {
                Ok(parsed) if parsed == platform => {}
                _ => continue,
            }
        }

        let image = format!("{app_name}_{}-{}", target.platform, target.architecture);
        for build_dir in &build_dirs {
            let symbolic = build_dir.join(format!("{image}.dbg"));
            let plain = build_dir.join(&image);
            let kernel = if opts.symbolic && symbolic.is_file() {
                symbolic
            } else if plain.is_file() {
                plain
            } else {
                continue;
            };
            built.push(BuiltTarget {
                target: target.clone(),
                kernel,
            });
            break;
        }
    }
    built
}

/// Volumes declared in the manifest ride along as plain host bindings.
fn append_manifest_volumes(machine: &mut Machine, dir: &Path, volumes: &[String]) -> Result<()> {
    for binding in volumes {
        let (source, destination) = parse_volume_binding(binding)?;
        let source = absolute_in(dir, Path::new(&source)).display().to_string();
        machine.spec.volumes.push(Volume {
            name: format!("{}-{}", machine.name, machine.spec.volumes.len()),
            spec: VolumeSpec {
                driver: "9pfs".into(),
                source,
                destination,
                ..VolumeSpec::default()
            },
            status: VolumeStatus::default(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use unikit_common::types::{Architecture, Platform};

    use crate::runner::NoPrompter;

    use super::*;

    fn project(targets: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("Kraftfile"),
            format!("spec: v0.6\nname: hello\nunikraft:\n  version: stable\ntargets:\n{targets}"),
        )
        .expect("manifest");
        std::fs::create_dir_all(dir.path().join(".unikraft/build")).expect("build dir");
        dir
    }

    fn build_kernel(dir: &tempfile::TempDir, image: &str) {
        std::fs::write(dir.path().join(".unikraft/build").join(image), b"\x7fELF")
            .expect("kernel");
    }

    #[test]
    fn runnable_requires_unikraft_section() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("Kraftfile"),
            "spec: v0.6\nruntime: unikraft.org/base:latest\n",
        )
        .expect("manifest");
        let runner = KraftfileUnikraftRunner::new();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            ..RunnerOpts::default()
        };
        assert!(!runner
            .runnable(&Context::background(), &opts, &[])
            .expect("probe"));
    }

    #[test]
    fn prepares_single_built_target() {
        let dir = project("  - plat: qemu\n    arch: x86_64\n");
        build_kernel(&dir, "hello_qemu-x86_64");

        let runner = KraftfileUnikraftRunner::new();
        let ctx = Context::background();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            ..RunnerOpts::default()
        };
        assert!(runner.runnable(&ctx, &opts, &[]).expect("probe"));

        let mut machine = Machine::new("probe");
        runner
            .prepare(&ctx, &opts, &NoPrompter, &mut machine, &[])
            .expect("prepare");
        assert_eq!(machine.spec.kernel, "project://hello:qemu-x86_64");
        assert_eq!(machine.spec.platform, Platform::Qemu);
        assert_eq!(machine.spec.architecture, Architecture::X86_64);
        assert!(machine.status.kernel_path.expect("kernel").is_file());
    }

    #[test]
    fn unbuilt_targets_are_not_found() {
        let dir = project("  - plat: qemu\n    arch: x86_64\n");
        let runner = KraftfileUnikraftRunner::new();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            ..RunnerOpts::default()
        };
        let mut machine = Machine::new("probe");
        let err = runner
            .prepare(&Context::background(), &opts, &NoPrompter, &mut machine, &[])
            .unwrap_err();
        assert!(matches!(err, UnikitError::NotFound { kind: "built target", .. }));
    }

    #[test]
    fn platform_filter_narrows_to_single_match() {
        let dir = project(
            "  - plat: qemu\n    arch: x86_64\n  - plat: fc\n    arch: x86_64\n",
        );
        build_kernel(&dir, "hello_qemu-x86_64");
        build_kernel(&dir, "hello_fc-x86_64");

        let runner = KraftfileUnikraftRunner::new();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            platform: Some(Platform::Firecracker),
            ..RunnerOpts::default()
        };
        let mut machine = Machine::new("probe");
        runner
            .prepare(&Context::background(), &opts, &NoPrompter, &mut machine, &[])
            .expect("prepare");
        assert_eq!(machine.spec.platform, Platform::Firecracker);
    }

    #[test]
    fn several_built_targets_without_prompt_fail() {
        let dir = project(
            "  - plat: qemu\n    arch: x86_64\n  - plat: fc\n    arch: x86_64\n",
        );
        build_kernel(&dir, "hello_qemu-x86_64");
        build_kernel(&dir, "hello_fc-x86_64");

        let runner = KraftfileUnikraftRunner::new();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            ..RunnerOpts::default()
        };
        let mut machine = Machine::new("probe");
        let err = runner
            .prepare(&Context::background(), &opts, &NoPrompter, &mut machine, &[])
            .unwrap_err();
        assert!(err.to_string().contains("--target"));
    }

    #[test]
    fn symbolic_prefers_debug_kernel() {
        let dir = project("  - plat: qemu\n    arch: x86_64\n");
        build_kernel(&dir, "hello_qemu-x86_64");
        build_kernel(&dir, "hello_qemu-x86_64.dbg");

        let runner = KraftfileUnikraftRunner::new();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            symbolic: true,
            ..RunnerOpts::default()
        };
        let mut machine = Machine::new("probe");
        runner
            .prepare(&Context::background(), &opts, &NoPrompter, &mut machine, &[])
            .expect("prepare");
        let kernel = machine.status.kernel_path.expect("kernel");
        assert!(kernel.to_string_lossy().ends_with(".dbg"));
    }
}
