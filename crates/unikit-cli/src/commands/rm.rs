//! `unikit rm` — remove machines and their durable state.

use std::process::ExitCode;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_machine::platform;
use unikit_machine::service::MachineService;

use crate::commands::parse_platform_flag;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Machine names.
    #[arg(required_unless_present = "all")]
    pub machines: Vec<String>,

    /// Remove every machine in a terminal state.
    #[arg(long)]
    pub all: bool,

    /// Platform to address (auto tries every platform).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,
}

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns an error if any machine cannot be removed.
pub fn execute(config: &RuntimeConfig, args: &RmArgs) -> anyhow::Result<ExitCode> {
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let service = platform::service_for(config, platform)?;
    let ctx = Context::background();

    let names: Vec<String> = if args.all {
        service
            .list(&ctx)?
            .into_iter()
            .filter(|m| m.status.state.is_terminal())
            .map(|m| m.name)
            .collect()
    } else {
        args.machines.clone()
    };

    for name in &names {
        service.delete(&ctx, name)?;
        println!("{name}");
    }
    Ok(ExitCode::SUCCESS)
}
