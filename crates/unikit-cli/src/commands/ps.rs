//! `unikit ps` — list machines across platforms.

use std::process::ExitCode;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_machine::platform;
use unikit_machine::service::MachineService;

use crate::commands::parse_platform_flag;
use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all machines, including exited and failed ones.
    #[arg(short, long)]
    pub all: bool,

    /// Platform to list (auto lists every platform).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,

    /// Include machine UIDs.
    #[arg(short, long)]
    pub long: bool,

    /// Print machine names only.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the machine store cannot be read.
pub fn execute(config: &RuntimeConfig, args: &PsArgs) -> anyhow::Result<ExitCode> {
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let service = platform::service_for(config, platform)?;
    let ctx = Context::background();

    let mut machines = service.list(&ctx)?;
    if !args.all {
        machines.retain(|m| !m.status.state.is_terminal());
    }

    if args.quiet {
        for machine in &machines {
            println!("{}", machine.name);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut header = vec!["NAME", "KERNEL", "ARGS", "CREATED", "STATUS", "MEM", "PLAT/ARCH"];
    if args.long {
        header.insert(0, "UID");
    }
    let mut rows = vec![header.into_iter().map(String::from).collect::<Vec<_>>()];
    for machine in &machines {
        let mut row = vec![
            machine.name.clone(),
            machine.spec.kernel.clone(),
            machine.spec.application_args.join(" "),
            machine
                .status
                .created_at
                .map_or_else(String::new, output::format_age),
            machine.status.state.to_string(),
            output::format_bytes(machine.spec.resources.requests.memory),
            format!("{}/{}", machine.spec.platform, machine.spec.architecture),
        ];
        if args.long {
            row.insert(0, machine.uid.short());
        }
        rows.push(row);
    }
    print!("{}", output::render_table(&rows));
    Ok(ExitCode::SUCCESS)
}
