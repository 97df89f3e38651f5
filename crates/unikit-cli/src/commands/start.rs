//! `unikit start` — start created (or resume paused) machines.

use std::process::ExitCode;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_machine::platform;
use unikit_machine::service::MachineService;

use crate::commands::parse_platform_flag;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Machine names.
    #[arg(required = true)]
    pub machines: Vec<String>,

    /// Platform to address (auto tries every platform).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if any machine cannot be started.
pub fn execute(config: &RuntimeConfig, args: &StartArgs) -> anyhow::Result<ExitCode> {
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let service = platform::service_for(config, platform)?;
    let ctx = Context::background();

    for name in &args.machines {
        let machine = service.start(&ctx, name)?;
        println!("{}", machine.name);
    }
    Ok(ExitCode::SUCCESS)
}
