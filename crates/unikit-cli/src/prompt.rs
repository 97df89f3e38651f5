//! Interactive selection on a terminal.

use std::io::Write;

use unikit_common::error::{Result, UnikitError};
use unikit_run::runner::Prompter;

/// Prompter that asks on stderr and reads the choice from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn select(&self, subject: &str, options: &[String]) -> Result<usize> {
        eprintln!("several candidates for {subject}:");
        for (index, option) in options.iter().enumerate() {
            eprintln!("  [{index}] {option}");
        }
        eprint!("selection [0-{}]: ", options.len().saturating_sub(1));
        std::io::stderr().flush().map_err(|e| UnikitError::Backend {
            message: format!("cannot prompt: {e}"),
        })?;

        let mut line = String::new();
        let _ = std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| UnikitError::Backend {
                message: format!("cannot read selection: {e}"),
            })?;
        let index: usize = line.trim().parse().map_err(|_| UnikitError::InvalidInput {
            message: format!("invalid selection: {}", line.trim()),
        })?;
        if index >= options.len() {
            return Err(UnikitError::InvalidInput {
                message: format!("selection {index} out of range"),
            });
        }
        Ok(index)
    }
}
