//! CLI command definitions and dispatch.

pub mod logs;
pub mod pause;
pub mod ps;
pub mod rm;
pub mod run;
pub mod start;
pub mod stop;

use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use unikit_common::config::RuntimeConfig;
use unikit_common::types::Platform;

/// unikit — build, package, and run unikernel machines.
#[derive(Parser, Debug)]
#[command(name = "unikit", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Runtime state directory (overrides UNIKIT_RUNTIME_DIR).
    #[arg(long, global = true)]
    pub runtime_dir: Option<String>,
}

impl Cli {
    /// Effective runtime configuration for this invocation.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.runtime_dir
            .as_ref()
            .map_or_else(RuntimeConfig::from_env, RuntimeConfig::with_runtime_dir)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a unikernel: a package, a project directory, a kernel binary,
    /// or a Linux executable.
    Run(run::RunArgs),
    /// List machines across platforms.
    Ps(ps::PsArgs),
    /// Start a created (or resume a paused) machine.
    Start(start::StartArgs),
    /// Pause running machines.
    Pause(pause::PauseArgs),
    /// Stop running machines.
    Stop(stop::StopArgs),
    /// Remove machines and their state.
    Rm(rm::RmArgs),
    /// Print or follow a machine's console log.
    Logs(logs::LogsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.config();
    match cli.command {
        Command::Run(args) => run::execute(&config, args),
        Command::Ps(args) => ps::execute(&config, &args),
        Command::Start(args) => start::execute(&config, &args),
        Command::Pause(args) => pause::execute(&config, &args),
        Command::Stop(args) => stop::execute(&config, &args),
        Command::Rm(args) => rm::execute(&config, &args),
        Command::Logs(args) => logs::execute(&config, &args),
    }
}

/// Parses a `--plat` value: `auto` (or empty) means every platform.
///
/// # Errors
///
/// Returns an error for unknown platform aliases.
pub fn parse_platform_flag(value: Option<&str>) -> anyhow::Result<Option<Platform>> {
    match value {
        None | Some("auto" | "") => Ok(None),
        Some(name) => Ok(Some(Platform::from_str(name)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_flag_auto_means_all() {
        assert_eq!(parse_platform_flag(None).expect("parse"), None);
        assert_eq!(parse_platform_flag(Some("auto")).expect("parse"), None);
        assert_eq!(
            parse_platform_flag(Some("kvm")).expect("parse"),
            Some(Platform::Qemu)
        );
        assert!(parse_platform_flag(Some("vbox")).is_err());
    }
}
