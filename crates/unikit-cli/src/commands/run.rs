//! `unikit run` — launch a unikernel from a heterogeneous argument.

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::constants::DEFAULT_MEMORY_SPEC;
use unikit_common::ctx::Context;
use unikit_common::types::{Architecture, MachineState};
use unikit_pack::NullPackageManager;
use unikit_run::pipeline::{RunOptions, RunPipeline};

use crate::commands::parse_platform_flag;
use crate::prompt::TerminalPrompter;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Positional input: package reference, project directory, kernel
    /// binary, or Linux executable, followed by application arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Guest architecture (x86_64, arm, arm64).
    #[arg(short = 'm', long = "arch")]
    pub arch: Option<String>,

    /// Platform to run on (qemu, fc, xen, auto).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,

    /// Run in the background and print the machine name.
    #[arg(short, long)]
    pub detach: bool,

    /// Disable hardware acceleration.
    #[arg(short = 'W', long)]
    pub disable_acceleration: bool,

    /// Environment variables (KEY=VALUE, or bare KEY to inherit).
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Static IP address for the first attached network.
    #[arg(long)]
    pub ip: Option<String>,

    /// Additional kernel arguments.
    #[arg(short = 'a', long = "kernel-arg")]
    pub kernel_args: Vec<String>,

    /// Path to the project manifest.
    #[arg(short = 'K', long)]
    pub kraftfile: Option<String>,

    /// MAC address for the first interface.
    #[arg(long)]
    pub mac: Option<String>,

    /// Guest memory (accepts Ki/Mi/Gi and K/M/G suffixes).
    #[arg(short = 'M', long, default_value = DEFAULT_MEMORY_SPEC)]
    pub memory: String,

    /// Machine name; generated when omitted.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Attach to a network: name[:CIDR[:gw[:dns0[:dns1[:host[:domain]]]]]].
    #[arg(long = "network")]
    pub networks: Vec<String>,

    /// Create the machine without starting it.
    #[arg(long)]
    pub no_start: bool,

    /// Forward a port: [hostIP:]hostPort:machinePort[/protocol].
    #[arg(short = 'p', long = "port")]
    pub ports: Vec<String>,

    /// Prefix attached log lines with this string.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Prefix attached log lines with the machine name.
    #[arg(long)]
    pub prefix_name: bool,

    /// Remove the machine when the attached run ends.
    #[arg(long = "rm")]
    pub remove: bool,

    /// Root filesystem: an initramfs archive or a directory.
    #[arg(long, alias = "initrd")]
    pub rootfs: Option<String>,

    /// Force a specific runner strategy.
    #[arg(long = "as")]
    pub run_as: Option<String>,

    /// Runtime package override for runtime/loader strategies.
    #[arg(short = 'r', long)]
    pub runtime: Option<String>,

    /// Register the machine with the host service wrapper instead of
    /// attaching.
    #[arg(long)]
    pub systemd: bool,

    /// Project target name to run.
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Mount a volume: host:guest.
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Boot the debug-symbol kernel where one exists.
    #[arg(long)]
    pub symbolic: bool,

    /// Force-stop and remove the machine after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the pipeline fails before or during launch.
pub fn execute(config: &RuntimeConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    if args.target.is_some() && args.run_as.is_some() {
        anyhow::bail!("--target and --as cannot be combined");
    }

    let architecture = args
        .arch
        .as_deref()
        .map(str::parse::<Architecture>)
        .transpose()?;
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();

    let prefix = args
        .prefix
        .clone()
        .or_else(|| (args.prefix_name && args.name.is_some()).then(|| args.name.clone().unwrap_or_default()));

    let options = RunOptions {
        architecture,
        platform,
        detach: args.detach,
        disable_acceleration: args.disable_acceleration,
        env: args.env.clone(),
        ip: args.ip.clone(),
        kernel_args: args.kernel_args.clone(),
        kraftfile: args.kraftfile.clone().map(Into::into),
        mac: args.mac.clone(),
        memory: args.memory.clone(),
        name: args.name.clone(),
        networks: args.networks.clone(),
        no_start: args.no_start,
        ports: args.ports.clone(),
        remove_on_exit: args.remove,
        rootfs: args.rootfs.clone().map(Into::into),
        run_as: args.run_as.clone(),
        runtime: args.runtime.clone(),
        systemd: args.systemd,
        target: args.target.clone(),
        volumes: args.volumes.clone(),
        symbolic: args.symbolic,
        allow_prompt: interactive,
        timeout_secs: args.timeout,
        workdir: std::env::current_dir()?,
    };

    let ctx = Context::background();
    let interrupt = ctx.clone();
    ctrlc::set_handler(move || interrupt.cancel())
        .map_err(|e| anyhow::anyhow!("failed to install interrupt handler: {e}"))?;

    let mut pipeline = RunPipeline::new(config.clone(), Arc::new(NullPackageManager))
        .with_log_sink(Box::new(move |line| match &prefix {
            Some(prefix) => println!("[{prefix}] {line}"),
            None => println!("{line}"),
        }));
    if interactive {
        pipeline = pipeline.with_prompter(Box::new(TerminalPrompter));
    }

    let outcome = pipeline.run(&ctx, &options, &args.args)?;

    match outcome.state {
        MachineState::Created => eprintln!("created {}", outcome.name),
        MachineState::Running => eprintln!("started {}", outcome.name),
        _ => {}
    }
    if args.detach || args.no_start || args.systemd {
        println!("{}", outcome.name);
    }

    // Attached runs exit with the guest's exit code.
    Ok(match outcome.exit_code {
        Some(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        None => ExitCode::SUCCESS,
    })
}
