//! `unikit pause` — pause running machines.

use std::process::ExitCode;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_machine::platform;
use unikit_machine::service::MachineService;

use crate::commands::parse_platform_flag;

/// Arguments for the `pause` command.
#[derive(Args, Debug)]
pub struct PauseArgs {
    /// Machine names.
    #[arg(required = true)]
    pub machines: Vec<String>,

    /// Platform to address (auto tries every platform).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,
}

/// Executes the `pause` command.
///
/// Machines already in a terminal state are skipped without error.
///
/// # Errors
///
/// Returns an error if a running machine cannot be paused.
pub fn execute(config: &RuntimeConfig, args: &PauseArgs) -> anyhow::Result<ExitCode> {
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let service = platform::service_for(config, platform)?;
    let ctx = Context::background();

    for name in &args.machines {
        let machine = service.get(&ctx, name)?;
        if machine.status.state.is_terminal() {
            tracing::debug!(name, state = %machine.status.state, "skipping terminal machine");
            continue;
        }
        let paused = service.pause(&ctx, name)?;
        println!("{}", paused.name);
    }
    Ok(ExitCode::SUCCESS)
}
