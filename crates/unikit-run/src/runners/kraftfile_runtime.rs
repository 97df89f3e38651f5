//! Runtime strategy: pair a project's root filesystem with a pre-built
//! runtime package named by the Kraftfile's `runtime` directive.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Architecture;
use unikit_machine::machine::Machine;
use unikit_pack::{PackageManager, PullOptions, Query, archive, find_packages};

use crate::kraftfile::{self, Application};
use crate::runner::{Prompter, Runner, RunnerOpts};
use crate::runners::select_package;

/// Launches a project that declares `runtime:` instead of building a
/// kernel of its own.
pub struct KraftfileRuntimeRunner {
    manager: Arc<dyn PackageManager>,
    parsed: Mutex<Option<(PathBuf, Application)>>,
}

impl KraftfileRuntimeRunner {
    /// Builds the strategy over the given package manager.
    #[must_use]
    pub fn new(manager: Arc<dyn PackageManager>) -> Self {
        Self {
            manager,
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
        let dir = match args.first() {
            Some(first) if Path::new(first).is_dir() => PathBuf::from(first),
            _ => opts.workdir.clone(),
        };
        if kraftfile::find_manifest(&dir, opts.kraftfile.as_deref()).is_none() {
            return Ok(None);
        }
        let app = kraftfile::load(&dir, opts.kraftfile.as_deref())?;
        let entry = (dir, app);
        *self.cache()? = Some(entry.clone());
        Ok(Some(entry))
    }
}

impl Runner for KraftfileRuntimeRunner {
    fn name(&self) -> &'static str {
        "kraftfile-runtime"
    }

    fn description(&self) -> &'static str {
        "run the cwd's Kraftfile with a pre-built runtime package"
    }

    fn runnable(&self, ctx: &Context, opts: &RunnerOpts, args: &[String]) -> Result<bool> {
        ctx.check()?;
        Ok(self
            .load(opts, args)?
            .is_some_and(|(_, app)| app.runtime.is_some()))
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
        let reference = opts
            .runtime
            .clone()
            .or_else(|| app.runtime.clone())
            .ok_or_else(|| UnikitError::InvalidInput {
                message: "Kraftfile has no runtime directive".into(),
            })?;

        let architecture = opts.architecture.or_else(Architecture::host);
        let query = Query::for_reference(&reference)
            .with_architecture(architecture)
            .with_platform(opts.platform);
        // Local first, then one remote-update retry.
        let packages = find_packages(self.manager.as_ref(), ctx, &query)?;
        if packages.is_empty() {
            return Err(UnikitError::NotFound {
                kind: "package",
                id: reference,
            });
        }
        let runtime = select_package(
            prompter,
            opts.allow_prompt,
            &reference,
            packages,
            architecture,
            opts.platform,
        )?;

        runtime.pull(ctx, &PullOptions::into_dir(&opts.stage_dir))?;
        if let Some(artifact) = runtime.artifact() {
            archive::unpack(ctx, &artifact, &opts.stage_dir.join("unpacked"))?;
        }
        let kernel_path = runtime.kernel().ok_or_else(|| UnikitError::NotFound {
            kind: "kernel",
            id: runtime.reference(),
        })?;

        machine.spec.kernel = format!("{}://{}", runtime.format(), runtime.reference());
        machine.status.kernel_path = Some(kernel_path);
        machine.status.initrd_path = runtime.initrd();
        if let Some(architecture) = runtime.architecture().or(architecture) {
            machine.spec.architecture = architecture;
        }
        if let Some(platform) = runtime.platform() {
            machine.spec.platform = platform;
        }

        let app_args = match args.first() {
            Some(first) if Path::new(first) == dir => args[1..].to_vec(),
            _ => args.to_vec(),
        };
        machine.spec.application_args = if app_args.is_empty() {
            app.cmd
                .as_ref()
                .map_or_else(|| runtime.command(), kraftfile::Command::to_args)
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
            machine.spec.rootfs = app.rootfs.as_ref().map(|r| {
                if r.is_absolute() {
                    r.clone()
                } else {
                    dir.join(r)
                }
            });
        }
        tracing::debug!(runtime = %runtime.reference(), "runtime machine prepared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use unikit_common::types::Platform;
    use unikit_pack::Package;

    use crate::runner::NoPrompter;

    use super::*;

    struct FakeRuntime {
        dir: PathBuf,
        architecture: Architecture,
        with_artifact: bool,
    }

    impl Package for FakeRuntime {
        fn name(&self) -> &str {
            "unikraft.org/nginx"
        }

        fn version(&self) -> &str {
            "latest"
        }

        fn format(&self) -> &str {
            "oci"
        }

        fn architecture(&self) -> Option<Architecture> {
            Some(self.architecture)
        }

        fn platform(&self) -> Option<Platform> {
            Some(Platform::Qemu)
        }

        fn kernel(&self) -> Option<PathBuf> {
            Some(self.dir.join("nginx_qemu-x86_64"))
        }

        fn kernel_dbg(&self) -> Option<PathBuf> {
            None
        }

        fn initrd(&self) -> Option<PathBuf> {
            None
        }

        fn artifact(&self) -> Option<PathBuf> {
            self.with_artifact.then(|| self.dir.join("rootfs.tar.gz"))
        }

        fn kconfig(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn command(&self) -> Vec<String> {
            vec!["nginx".into()]
        }

        fn metadata(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn pull(&self, _ctx: &Context, opts: &PullOptions) -> Result<()> {
            std::fs::create_dir_all(&opts.workdir)
                .map_err(|e| UnikitError::io(&opts.workdir, e))?;
            std::fs::write(self.dir.join("nginx_qemu-x86_64"), b"\x7fELF")
                .map_err(|e| UnikitError::io(&self.dir, e))
        }
    }

    struct FakeManager {
        dir: PathBuf,
        architecture: Architecture,
        with_artifact: bool,
        remote_only: bool,
    }

    impl PackageManager for FakeManager {
        fn update(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }

        fn catalog(&self, _ctx: &Context, query: &Query) -> Result<Vec<Arc<dyn Package>>> {
            if self.remote_only && !query.remote {
                return Ok(Vec::new());
            }
            if query.name.as_deref() == Some("unikraft.org/nginx") {
                Ok(vec![Arc::new(FakeRuntime {
                    dir: self.dir.clone(),
                    architecture: self.architecture,
                    with_artifact: self.with_artifact,
                })])
            } else {
                Ok(Vec::new())
            }
        }

        fn is_compatible(&self, _ctx: &Context, _reference: &str, _query: &Query) -> Result<bool> {
            Ok(false)
        }
    }

    fn project(dir: &Path) {
        std::fs::write(
            dir.join("Kraftfile"),
            "spec: v0.6\nruntime: unikraft.org/nginx:latest\ncmd: [nginx, -g, daemon off;]\n",
        )
        .expect("manifest");
    }

    #[test]
    fn resolves_runtime_from_remote_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        project(dir.path());
        let runner = KraftfileRuntimeRunner::new(Arc::new(FakeManager {
            dir: dir.path().to_path_buf(),
            architecture: Architecture::host().unwrap_or(Architecture::X86_64),
            with_artifact: false,
            remote_only: true,
        }));
        let ctx = Context::background();
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            stage_dir: dir.path().join("stage"),
            ..RunnerOpts::default()
        };
        assert!(runner.runnable(&ctx, &opts, &[]).expect("probe"));

        let mut machine = Machine::new("probe");
        runner
            .prepare(&ctx, &opts, &NoPrompter, &mut machine, &[])
            .expect("prepare");
        assert_eq!(machine.spec.kernel, "oci://unikraft.org/nginx:latest");
        assert_eq!(machine.spec.platform, Platform::Qemu);
        assert_eq!(machine.spec.application_args[0], "nginx");
        assert!(machine.status.kernel_path.is_some());
    }

    #[test]
    fn pulled_artifact_is_unpacked() {
        let dir = tempfile::tempdir().expect("tempdir");
        project(dir.path());

        // A tiny tar.gz the fake package points at.
        let archive_path = dir.path().join("rootfs.tar.gz");
        let file = std::fs::File::create(&archive_path).expect("archive");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/os", &b"beta"[..])
            .expect("append");
        let _ = builder.into_inner().expect("tar").finish().expect("gzip");

        let runner = KraftfileRuntimeRunner::new(Arc::new(FakeManager {
            dir: dir.path().to_path_buf(),
            architecture: Architecture::host().unwrap_or(Architecture::X86_64),
            with_artifact: true,
            remote_only: false,
        }));
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            stage_dir: dir.path().join("stage"),
            ..RunnerOpts::default()
        };
        let mut machine = Machine::new("probe");
        runner
            .prepare(&Context::background(), &opts, &NoPrompter, &mut machine, &[])
            .expect("prepare");
        assert!(opts.stage_dir.join("unpacked/etc/os").is_file());
    }

    #[test]
    fn missing_runtime_package_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("Kraftfile"),
            "spec: v0.6\nruntime: unikraft.org/missing:latest\n",
        )
        .expect("manifest");
        let runner = KraftfileRuntimeRunner::new(Arc::new(FakeManager {
            dir: dir.path().to_path_buf(),
            architecture: Architecture::X86_64,
            with_artifact: false,
            remote_only: false,
        }));
        let opts = RunnerOpts {
            workdir: dir.path().to_path_buf(),
            stage_dir: dir.path().join("stage"),
            ..RunnerOpts::default()
        };
        let mut machine = Machine::new("probe");
        let err = runner
            .prepare(&Context::background(), &opts, &NoPrompter, &mut machine, &[])
            .unwrap_err();
        assert!(matches!(err, UnikitError::NotFound { kind: "package", .. }));
    }
}
