//! Runner strategy contract and selection.

use std::path::PathBuf;

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::{Architecture, Platform};
use unikit_machine::machine::Machine;

/// Everything a strategy may consult while probing and preparing.
#[derive(Debug, Clone, Default)]
pub struct RunnerOpts {
    /// Requested guest architecture, if the user pinned one.
    pub architecture: Option<Architecture>,
    /// Requested platform, if the user pinned one.
    pub platform: Option<Platform>,
    /// Requested target name for project builds.
    pub target: Option<String>,
    /// Runtime package override (`-r/--runtime`).
    pub runtime: Option<String>,
    /// Working directory the invocation runs from.
    pub workdir: PathBuf,
    /// Explicit manifest path (`-K/--kraftfile`).
    pub kraftfile: Option<PathBuf>,
    /// Staging directory for pulled artifacts; cleaned up by the pipeline
    /// unless the machine is created successfully.
    pub stage_dir: PathBuf,
    /// Whether interactive disambiguation is allowed.
    pub allow_prompt: bool,
    /// Prefer the debug-symbol kernel where one exists.
    pub symbolic: bool,
}

/// Interactive disambiguation between equally plausible choices.
pub trait Prompter: Send + Sync {
    /// Asks the user to pick one of `options`, returning its index.
    ///
    /// # Errors
    ///
    /// Returns an error when no interactive terminal is available.
    fn select(&self, subject: &str, options: &[String]) -> Result<usize>;
}

/// Prompter used in non-interactive contexts; always refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompter;

impl Prompter for NoPrompter {
    fn select(&self, subject: &str, options: &[String]) -> Result<usize> {
        Err(UnikitError::InvalidInput {
            message: format!(
                "multiple candidates for {subject} and prompting is disabled: {}",
                options.join(", ")
            ),
        })
    }
}

/// One of the five launch policies.
///
/// `runnable` must be side-effect-free apart from caching its parsed form
/// on the strategy instance; `prepare` mutates the passed machine in
/// place.
pub trait Runner {
    /// Stable strategy name used with `--as`.
    fn name(&self) -> &'static str;

    /// One-line human description.
    fn description(&self) -> &'static str;

    /// Whether this strategy can launch the given arguments.
    ///
    /// # Errors
    ///
    /// Returns an error describing why probing itself failed; a clean
    /// "not mine" is `Ok(false)`.
    fn runnable(&self, ctx: &Context, opts: &RunnerOpts, args: &[String]) -> Result<bool>;

    /// Materialises the machine spec/status for the arguments.
    ///
    /// # Errors
    ///
    /// Returns an error when the input cannot be turned into a bootable
    /// machine.
    fn prepare(
        &self,
        ctx: &Context,
        opts: &RunnerOpts,
        prompter: &dyn Prompter,
        machine: &mut Machine,
        args: &[String],
    ) -> Result<()>;
}

impl std::fmt::Debug for dyn Runner + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").field("name", &self.name()).finish()
    }
}

/// Selects exactly one strategy for the invocation.
///
/// With `run_as` set only that strategy is consulted. Otherwise every
/// strategy is probed in declaration order: zero candidates joins all
/// probing errors, several candidates prompts (or fails when prompting is
/// disabled).
///
/// # Errors
///
/// Returns `InvalidInput` for an unknown forced strategy, the joined
/// probing errors when nothing matches, or the prompter's refusal.
pub fn choose<'a>(
    ctx: &Context,
    opts: &RunnerOpts,
    prompter: &dyn Prompter,
    runners: &'a [Box<dyn Runner>],
    run_as: Option<&str>,
    args: &[String],
) -> Result<&'a dyn Runner> {
    if let Some(forced) = run_as {
        let runner = runners
            .iter()
            .find(|r| r.name() == forced)
            .ok_or_else(|| UnikitError::InvalidInput {
                message: format!("unknown runner: {forced}"),
            })?;
        return if runner.runnable(ctx, opts, args)? {
            Ok(runner.as_ref())
        } else {
            Err(UnikitError::InvalidInput {
                message: format!("runner {forced} cannot launch the given arguments"),
            })
        };
    }

    let mut candidates = Vec::new();
    let mut probe_errors = Vec::new();
    for runner in runners {
        ctx.check()?;
        match runner.runnable(ctx, opts, args) {
            Ok(true) => candidates.push(runner.as_ref()),
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(runner = runner.name(), error = %e, "probe failed");
                probe_errors.push(e);
            }
        }
    }

    match candidates.len() {
        0 => {
            if probe_errors.is_empty() {
                probe_errors.push(UnikitError::InvalidInput {
                    message: "no runner recognises the given arguments".into(),
                });
            }
            Err(UnikitError::aggregate("could not determine how to run", probe_errors))
        }
        1 => Ok(candidates[0]),
        _ => {
            let options: Vec<String> = candidates
                .iter()
                .map(|r| format!("{} ({})", r.name(), r.description()))
                .collect();
            if !opts.allow_prompt {
                return Err(UnikitError::InvalidInput {
                    message: format!(
                        "several runners match, pass --as to choose one of: {}",
                        candidates
                            .iter()
                            .map(|r| r.name())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
            }
            let index = prompter.select("runner", &options)?;
            candidates
                .get(index)
                .copied()
                .ok_or_else(|| UnikitError::InvalidInput {
                    message: format!("selection {index} out of range"),
                })
        }
    }
}
