//! The run pipeline: from CLI arguments to a supervised machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use unikit_common::config::RuntimeConfig;
use unikit_common::constants::{DEFAULT_MEMORY_SPEC, MIN_MEMORY_BYTES};
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::namegen;
use unikit_common::quantity;
use unikit_common::types::{
    Architecture, MachineState, Platform, SystemMode, validate_dns_label,
};
use unikit_machine::machine::{AttachedNetwork, Machine};
use unikit_machine::platform;
use unikit_machine::service::MachineService;
use unikit_pack::PackageManager;
use unikit_resources::network::{AttachRequest, NetworkService};
use unikit_resources::port::{self, Port};
use unikit_resources::volume::{VolumeService, VolumeSpec, parse_volume_binding};

use crate::rootfs::{self, InitrdBuilder, PassthroughInitrd};
use crate::runner::{NoPrompter, Prompter, RunnerOpts};
use crate::runners;

/// How many regenerated names are attempted before giving up.
const NAME_RETRIES: u32 = 10;

/// All knobs of a `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Requested guest architecture.
    pub architecture: Option<Architecture>,
    /// Requested platform; `None` means auto-detect.
    pub platform: Option<Platform>,
    /// Return right after starting instead of attaching.
    pub detach: bool,
    /// Force software emulation even on capable hosts.
    pub disable_acceleration: bool,
    /// `KEY=VALUE` settings and bare `KEY` host inherits.
    pub env: Vec<String>,
    /// Static IP for the first attached network.
    pub ip: Option<String>,
    /// Extra kernel arguments.
    pub kernel_args: Vec<String>,
    /// Explicit manifest path.
    pub kraftfile: Option<PathBuf>,
    /// MAC override for the first interface or port.
    pub mac: Option<String>,
    /// Memory quantity string, e.g. `64Mi`.
    pub memory: String,
    /// Requested machine name; generated when absent.
    pub name: Option<String>,
    /// Networks to attach, `name[:CIDR[:gw[:dns0[:dns1[:host[:domain]]]]]]`.
    pub networks: Vec<String>,
    /// Create the machine but do not start it.
    pub no_start: bool,
    /// Ports to forward, `[hostIP:]hostPort:machinePort[/protocol]`.
    pub ports: Vec<String>,
    /// Remove the machine when the attached run ends.
    pub remove_on_exit: bool,
    /// Root filesystem override; authoritative over strategy output.
    pub rootfs: Option<PathBuf>,
    /// Force a specific runner strategy by name.
    pub run_as: Option<String>,
    /// Runtime package override.
    pub runtime: Option<String>,
    /// Wrap the machine as a host service instead of attaching.
    pub systemd: bool,
    /// Project target name.
    pub target: Option<String>,
    /// Volumes to mount, `host:guest`.
    pub volumes: Vec<String>,
    /// Prefer debug-symbol kernels.
    pub symbolic: bool,
    /// Whether interactive prompts are allowed.
    pub allow_prompt: bool,
    /// Force-stop and delete a still-running machine after this many
    /// seconds of attachment.
    pub timeout_secs: Option<u64>,
    /// Directory the invocation runs from.
    pub workdir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            architecture: None,
            platform: None,
            detach: false,
            disable_acceleration: false,
            env: Vec::new(),
            ip: None,
            kernel_args: Vec::new(),
            kraftfile: None,
            mac: None,
            memory: DEFAULT_MEMORY_SPEC.to_string(),
            name: None,
            networks: Vec::new(),
            no_start: false,
            ports: Vec::new(),
            remove_on_exit: false,
            rootfs: None,
            run_as: None,
            runtime: None,
            systemd: false,
            target: None,
            volumes: Vec::new(),
            symbolic: false,
            allow_prompt: false,
            timeout_secs: None,
            workdir: PathBuf::from("."),
        }
    }
}

/// What a `run` invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Final machine name.
    pub name: String,
    /// State the machine was left in.
    pub state: MachineState,
    /// Guest exit code when the run was attached to completion.
    pub exit_code: Option<i32>,
}

/// Orchestrates runner selection, resource composition, creation, and
/// supervision.
pub struct RunPipeline {
    config: RuntimeConfig,
    manager: Arc<dyn PackageManager>,
    initrd: Box<dyn InitrdBuilder>,
    prompter: Box<dyn Prompter>,
    log_sink: Box<dyn Fn(&str) + Send + Sync>,
}

impl RunPipeline {
    /// Builds a pipeline with non-interactive defaults.
    #[must_use]
    pub fn new(config: RuntimeConfig, manager: Arc<dyn PackageManager>) -> Self {
        Self {
            config,
            manager,
            initrd: Box::new(PassthroughInitrd),
            prompter: Box::new(NoPrompter),
            log_sink: Box::new(|_| {}),
        }
    }

    /// Replaces the interactive prompter.
    #[must_use]
    pub fn with_prompter(mut self, prompter: Box<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Replaces the initramfs serializer.
    #[must_use]
    pub fn with_initrd_builder(mut self, builder: Box<dyn InitrdBuilder>) -> Self {
        self.initrd = builder;
        self
    }

    /// Replaces the sink attached log lines are delivered to.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Box<dyn Fn(&str) + Send + Sync>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Runs the full pipeline.
    ///
    /// # Errors
    ///
    /// Any error before machine creation aborts without touching the
    /// store; errors after creation propagate while the machine stays
    /// persisted for inspection.
    pub fn run(&self, ctx: &Context, opts: &RunOptions, args: &[String]) -> Result<RunOutcome> {
        ctx.check()?;

        // 1. Effective platform, and whether hardware acceleration is
        // even an option on this host.
        let mut emulation = opts.disable_acceleration;
        let platform_choice = match opts.platform {
            Some(platform) => Some(platform),
            None => match platform::detect(ctx) {
                Ok((platform, mode)) => {
                    if mode == SystemMode::Guest {
                        // Nested hosts get no acceleration.
                        emulation = true;
                    }
                    (platform != Platform::Unknown).then_some(platform)
                }
                Err(e) if matches!(e, UnikitError::Canceled) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "platform detection failed, iterating all platforms");
                    None
                }
            },
        };

        // 2. Effective machine service.
        let service = platform::service_for(&self.config, platform_choice)?;

        // 3. Fail fast on port collisions before any expensive work.
        let ports = port::parse_ports(&opts.ports)?;
        self.reserve_ports(ctx, service.as_ref(), &ports)?;

        // Staging directory for pulled artifacts; removed on any failure
        // or panic until the machine owns it.
        let stage_dir = self
            .config
            .runtime_dir
            .join("staging")
            .join(uuid_component());
        std::fs::create_dir_all(&stage_dir).map_err(|e| UnikitError::io(&stage_dir, e))?;
        let stage_guard = StageGuard::new(stage_dir.clone());

        // 4. Select exactly one runner.
        let runner_opts = RunnerOpts {
            architecture: opts.architecture,
            platform: platform_choice,
            target: opts.target.clone(),
            runtime: opts.runtime.clone(),
            workdir: opts.workdir.clone(),
            kraftfile: opts.kraftfile.clone(),
            stage_dir,
            allow_prompt: opts.allow_prompt,
            symbolic: opts.symbolic,
        };
        let all_runners = runners::default_runners(Arc::clone(&self.manager));
        let runner = crate::runner::choose(
            ctx,
            &runner_opts,
            self.prompter.as_ref(),
            &all_runners,
            opts.run_as.as_deref(),
            args,
        )?;
        tracing::info!(runner = runner.name(), "runner selected");

        // 5. Materialise the machine.
        let mut machine = Machine::new("pending");
        machine.spec.architecture = opts
            .architecture
            .or_else(Architecture::host)
            .unwrap_or(Architecture::X86_64);
        machine.name = self.resolve_name(ctx, opts.name.as_deref())?;
        runner.prepare(ctx, &runner_opts, self.prompter.as_ref(), &mut machine, args)?;
        if machine.spec.platform == Platform::Unknown {
            machine.spec.platform = platform_choice.unwrap_or(Platform::Qemu);
        }
        machine.spec.emulation = emulation;

        // 6. CLI overrides and resource composition.
        machine.spec.kernel_args.extend(opts.kernel_args.iter().cloned());
        machine.spec.resources.requests.memory = parse_memory(&opts.memory)?;
        machine.spec.ports = ports;
        apply_env(&mut machine, &opts.env);
        let network_service = NetworkService::open(&self.config)?;
        let reservations = self.assign_networks(ctx, &network_service, &mut machine, opts)?;
        let result = self.finish(ctx, service.as_ref(), &mut machine, opts, &runner_opts);
        match result {
            Ok(outcome) => {
                stage_guard.disarm();
                Ok(outcome)
            }
            Err(e) => {
                // Roll back reserved interfaces; the staging guard drops
                // the pulled artifacts.
                for (network, uid) in reservations {
                    let _ = network_service.detach(ctx, &network, uid);
                }
                Err(e)
            }
        }
    }

    /// Steps 6 (tail) through 9.
    fn finish(
        &self,
        ctx: &Context,
        service: &dyn MachineService,
        machine: &mut Machine,
        opts: &RunOptions,
        runner_opts: &RunnerOpts,
    ) -> Result<RunOutcome> {
        self.assign_volumes(ctx, machine, &opts.volumes)?;

        if opts.rootfs.is_some() {
            // The CLI rootfs is authoritative over strategy output.
            machine.spec.rootfs = opts.rootfs.clone();
        }
        if let Some(source) = machine.spec.rootfs.clone() {
            let initramfs =
                rootfs::resolve(ctx, self.initrd.as_ref(), &source, &runner_opts.stage_dir)?;
            machine.status.initrd_path = Some(initramfs);
        }
        if let (Some(initrd), memory) = (
            machine.status.initrd_path.as_deref(),
            machine.spec.resources.requests.memory,
        ) {
            if let Ok(meta) = std::fs::metadata(initrd) {
                if meta.len() > memory {
                    tracing::warn!(
                        initrd = %initrd.display(),
                        initrd_bytes = meta.len(),
                        memory_bytes = memory,
                        "initramfs is larger than the requested memory"
                    );
                }
            }
        }
        if let Some(mac) = &opts.mac {
            // Interfaces already carry the override from reservation time.
            if machine.spec.networks.is_empty() {
                if let Some(first_port) = machine.spec.ports.first_mut() {
                    first_port.mac_address = Some(mac.clone());
                }
            }
        }

        // 7. Create, then start unless asked not to.
        let created = service.create(ctx, machine)?;
        tracing::info!(name = %created.name, "machine created");
        if opts.no_start && !opts.systemd {
            return Ok(RunOutcome {
                name: created.name,
                state: MachineState::Created,
                exit_code: None,
            });
        }
        let started = service.start(ctx, &created.name)?;

        // 8. Hand off to the host service wrapper, or attach.
        if opts.systemd {
            self.write_service_metadata(&started)?;
            return Ok(RunOutcome {
                name: started.name,
                state: started.status.state,
                exit_code: None,
            });
        }
        if opts.detach {
            return Ok(RunOutcome {
                name: started.name,
                state: started.status.state,
                exit_code: None,
            });
        }

        let outcome = self.attach(ctx, service, &started.name, opts);

        // 9. `--rm` deletes regardless of how the run ended.
        if opts.remove_on_exit {
            if let Err(e) = service.delete(ctx, &started.name) {
                tracing::warn!(name = %started.name, error = %e, "remove-on-exit failed");
            }
        }
        outcome
    }

    /// Streams logs and events until the machine reaches a terminal state,
    /// the context is cancelled, or the attach timeout fires.
    fn attach(
        &self,
        ctx: &Context,
        service: &dyn MachineService,
        name: &str,
        opts: &RunOptions,
    ) -> Result<RunOutcome> {
        let wait_ctx = match opts.timeout_secs {
            Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
            None => ctx.clone(),
        };
        let (lines, _line_errs) = service.logs(&wait_ctx, name)?;
        let (events, errs) = service.watch(&wait_ctx, name)?;

        loop {
            if wait_ctx.is_cancelled() {
                if ctx.is_cancelled() {
                    return Err(UnikitError::Canceled);
                }
                // The attach timeout fired: force the machine down and
                // remove it.
                tracing::warn!(name, "attach timeout elapsed, force-stopping");
                let _ = service.stop(ctx, name);
                service.delete(ctx, name)?;
                return Ok(RunOutcome {
                    name: name.to_string(),
                    state: MachineState::Exited,
                    exit_code: None,
                });
            }
            while let Ok(line) = lines.try_recv() {
                (self.log_sink)(&line);
            }
            if let Ok(sentinel) = errs.try_recv() {
                if sentinel.is_terminal_sentinel() {
                    break;
                }
                return Err(sentinel);
            }
            match events.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => {
                    tracing::debug!(name, state = %event.state, "state transition");
                    if event.state.is_terminal() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Drain whatever the guest wrote between the last poll and the
        // terminal event.
        while let Ok(line) = lines.try_recv() {
            (self.log_sink)(&line);
        }

        let settled = service.get(ctx, name)?;
        Ok(RunOutcome {
            name: settled.name,
            state: settled.status.state,
            exit_code: settled.status.exit_code,
        })
    }

    /// Step 3: reject host port collisions before any expensive work.
    fn reserve_ports(
        &self,
        ctx: &Context,
        service: &dyn MachineService,
        ports: &[Port],
    ) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }
        let existing = service.list(ctx)?;
        let reserved: Vec<Port> = existing
            .iter()
            .flat_map(|m| m.spec.ports.iter().cloned())
            .collect();
        if let Some((port, taken)) = port::find_collision(ports, &reserved) {
            return Err(UnikitError::Conflict {
                message: format!("host port {port} is already bound by {taken}"),
            });
        }
        Ok(())
    }

    /// Validates or generates a machine name unique across all platforms.
    fn resolve_name(&self, ctx: &Context, requested: Option<&str>) -> Result<String> {
        let everything = platform::service_for(&self.config, None)?;
        let taken: Vec<String> = everything
            .list(ctx)?
            .into_iter()
            .map(|m| m.name)
            .collect();

        if let Some(name) = requested {
            validate_dns_label(name)?;
            if taken.iter().any(|t| t == name) {
                return Err(UnikitError::Conflict {
                    message: "machine instance name already in use".into(),
                });
            }
            return Ok(name.to_string());
        }

        for retry in 0..NAME_RETRIES {
            let candidate = namegen::random_name(retry);
            if !taken.iter().any(|t| *t == candidate) {
                return Ok(candidate);
            }
        }
        Err(UnikitError::Fatal {
            message: "could not generate a unique machine name".into(),
        })
    }

    /// Attaches requested networks, reserving one interface per request.
    fn assign_networks(
        &self,
        ctx: &Context,
        service: &NetworkService,
        machine: &mut Machine,
        opts: &RunOptions,
    ) -> Result<Vec<(String, uuid::Uuid)>> {
        if opts.networks.is_empty() {
            if opts.ip.is_some() {
                return Err(UnikitError::InvalidInput {
                    message: "--ip requires --network".into(),
                });
            }
            return Ok(Vec::new());
        }

        let mut reservations: Vec<(String, uuid::Uuid)> = Vec::new();
        for (index, spec) in opts.networks.iter().enumerate() {
            let attached: Result<AttachedNetwork> = (|| {
                let mut request: AttachRequest = spec.parse()?;
                if index == 0 && request.ip.is_none() {
                    request.ip = opts.ip.clone();
                }
                let mut interface = service.attach(ctx, &request)?;
                if index == 0 {
                    if let Some(mac) = &opts.mac {
                        interface.mac = mac.clone();
                    }
                }
                Ok(AttachedNetwork {
                    network: request.network,
                    interface,
                })
            })();
            match attached {
                Ok(attached) => {
                    reservations.push((attached.network.clone(), attached.interface.uid));
                    machine.spec.networks.push(attached);
                }
                Err(e) => {
                    // Release what this invocation already reserved.
                    for (network, uid) in reservations {
                        let _ = service.detach(ctx, &network, uid);
                    }
                    return Err(e);
                }
            }
        }
        Ok(reservations)
    }

    /// Reuses named volumes, creates `<machine>-<index>` bindings for
    /// everything else.
    fn assign_volumes(&self, ctx: &Context, machine: &mut Machine, bindings: &[String]) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        let service = VolumeService::open(&self.config)?;
        for (index, binding) in bindings.iter().enumerate() {
            let (source, destination) = parse_volume_binding(binding)?;
            // A bare label may name an existing managed volume; host paths
            // always get a fresh per-machine binding.
            let named = validate_dns_label(&source)
                .is_ok()
                .then(|| service.get(ctx, &source))
                .and_then(std::result::Result::ok);
            let volume = match named {
                Some(mut existing) => {
                    let _ = service.bind(ctx, &existing.name)?;
                    existing.spec.destination = destination;
                    existing
                }
                None => {
                    let name = format!("{}-{index}", machine.name);
                    let created = service.create(
                        ctx,
                        &name,
                        VolumeSpec {
                            driver: "9pfs".into(),
                            source,
                            destination,
                            ..VolumeSpec::default()
                        },
                    )?;
                    let _ = service.bind(ctx, &created.name)?;
                    created
                }
            };
            machine.spec.volumes.push(volume);
        }
        Ok(())
    }

    /// `--systemd`: describe the machine to the external service wrapper.
    fn write_service_metadata(&self, machine: &Machine) -> Result<()> {
        let dir = self.config.systemd_dir();
        std::fs::create_dir_all(&dir).map_err(|e| UnikitError::io(&dir, e))?;
        let path = dir.join(format!("{}.json", machine.name));
        let metadata = serde_json::json!({
            "name": machine.name,
            "uid": machine.uid,
            "kernel": machine.spec.kernel,
            "platform": machine.spec.platform,
            "stateDir": machine.status.state_dir,
        });
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(&metadata).map_err(UnikitError::from)?,
        )
        .map_err(|e| UnikitError::io(&path, e))?;
        tracing::info!(name = %machine.name, path = %path.display(), "service metadata written");
        Ok(())
    }
}

/// Parses the memory flag and enforces the floor early, before any
/// machine state exists.
fn parse_memory(spec: &str) -> Result<u64> {
    let bytes = quantity::parse_quantity(spec)?;
    if bytes < MIN_MEMORY_BYTES {
        return Err(UnikitError::InvalidInput {
            message: "memory must be at least 1Mi".into(),
        });
    }
    Ok(bytes)
}

fn apply_env(machine: &mut Machine, entries: &[String]) {
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) => {
                let _ = machine.spec.env.insert(key.to_string(), value.to_string());
            }
            None => {
                // Bare KEY inherits the host value when present.
                if let Ok(value) = std::env::var(entry) {
                    let _ = machine.spec.env.insert(entry.clone(), value);
                }
            }
        }
    }
}

fn uuid_component() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Removes the staging directory unless the machine took ownership.
struct StageGuard {
    path: PathBuf,
    armed: std::cell::Cell<bool>,
}

impl StageGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: std::cell::Cell::new(true),
        }
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
