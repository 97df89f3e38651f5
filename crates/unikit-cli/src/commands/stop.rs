//! `unikit stop` — shut running machines down.

use std::process::ExitCode;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_common::types::MachineState;
use unikit_machine::platform;
use unikit_machine::service::MachineService;

use crate::commands::parse_platform_flag;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Machine names.
    #[arg(required_unless_present = "all")]
    pub machines: Vec<String>,

    /// Stop every running machine.
    #[arg(long)]
    pub all: bool,

    /// Platform to address (auto tries every platform).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if any machine cannot be stopped.
pub fn execute(config: &RuntimeConfig, args: &StopArgs) -> anyhow::Result<ExitCode> {
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let service = platform::service_for(config, platform)?;
    let ctx = Context::background();

    let names: Vec<String> = if args.all {
        service
            .list(&ctx)?
            .into_iter()
            .filter(|m| m.status.state == MachineState::Running)
            .map(|m| m.name)
            .collect()
    } else {
        args.machines.clone()
    };

    for name in &names {
        let machine = service.stop(&ctx, name)?;
        println!("{}", machine.name);
    }
    Ok(ExitCode::SUCCESS)
}
