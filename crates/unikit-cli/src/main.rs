//! # unikit — unikernel toolkit CLI
//!
//! Builds, packages, and runs unikernel machines under QEMU or
//! Firecracker. Single binary for the whole machine lifecycle.

#![allow(
    clippy::unnecessary_wraps,
    clippy::needless_pass_by_value,
    clippy::print_stdout,
    clippy::print_stderr
)]

mod commands;
mod output;
mod prompt;

use std::process::ExitCode;

use clap::Parser;

use crate::commands::Cli;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("unikit: {e:#}");
            ExitCode::FAILURE
        }
    }
}
