//! `unikit logs` — print or follow a machine's console log.

use std::process::ExitCode;

use clap::Args;
use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_machine::platform;
use unikit_machine::service::MachineService;

use crate::commands::parse_platform_flag;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Machine name.
    pub machine: String,

    /// Follow the log until the machine reaches a terminal state.
    #[arg(short, long)]
    pub follow: bool,

    /// Platform to address (auto tries every platform).
    #[arg(long = "plat", default_value = "auto")]
    pub plat: String,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the machine or its log file cannot be found.
pub fn execute(config: &RuntimeConfig, args: &LogsArgs) -> anyhow::Result<ExitCode> {
    let platform = parse_platform_flag(Some(args.plat.as_str()))?;
    let service = platform::service_for(config, platform)?;
    let ctx = Context::background();

    if !args.follow {
        // One-shot: dump the log file as it is right now.
        let machine = service.get(&ctx, &args.machine)?;
        if let Some(log_file) = &machine.status.log_file {
            if log_file.is_file() {
                print!("{}", std::fs::read_to_string(log_file)?);
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let interrupt = ctx.clone();
    ctrlc::set_handler(move || interrupt.cancel())
        .map_err(|e| anyhow::anyhow!("failed to install interrupt handler: {e}"))?;

    let (lines, errs) = service.logs(&ctx, &args.machine)?;
    loop {
        match lines.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(line) => println!("{line}"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if ctx.is_cancelled() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    let exit_code = errs.try_recv().ok().and_then(|sentinel| {
        sentinel
            .is_terminal_sentinel()
            .then(|| service.get(&ctx, &args.machine).ok())
            .flatten()
            .and_then(|m| m.status.exit_code)
    });

    Ok(match exit_code {
        Some(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        None => ExitCode::SUCCESS,
    })
}
