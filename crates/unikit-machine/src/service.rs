//! The per-platform machine service contract.

use std::sync::mpsc::Receiver;

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Platform;
use unikit_store::{BeforeHook, Op};

use crate::machine::{Machine, MachineEvent};

/// Paired event and error channels returned by `watch`.
///
/// The service closes both channels and emits the
/// [`UnikitError::MachineTerminated`] sentinel exactly once when the machine
/// reaches a terminal state. Subscribers that stop reading must cancel their
/// context to release the producer.
pub type EventStream = (Receiver<MachineEvent>, Receiver<UnikitError>);

/// Paired log-line and error channels returned by `logs`.
pub type LogStream = (Receiver<String>, Receiver<UnikitError>);

/// A VMM driver for one platform, persisting machines through the object
/// store and supervising their guest processes.
pub trait MachineService: Send + Sync {
    /// The platform this service owns, or [`Platform::Unknown`] for
    /// cross-platform composites.
    fn platform(&self) -> Platform;

    /// Allocates durable state for a machine and persists it as `created`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for duplicate names, `InvalidInput` for
    /// under-floor memory requests, and `NotFound` for missing kernels.
    fn create(&self, ctx: &Context, machine: &Machine) -> Result<Machine>;

    /// Boots (or resumes) the guest.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the machine is `created` or
    /// `paused`, or a backend error if the VMM cannot be spawned.
    fn start(&self, ctx: &Context, name: &str) -> Result<Machine>;

    /// Suspends guest execution in place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the machine is `running`.
    fn pause(&self, ctx: &Context, name: &str) -> Result<Machine>;

    /// Shuts the guest down with a bounded grace period.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the machine is `running`.
    fn stop(&self, ctx: &Context, name: &str) -> Result<Machine>;

    /// Persists spec changes to an existing machine.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown machines.
    fn update(&self, ctx: &Context, machine: &Machine) -> Result<Machine>;

    /// Removes the machine, its state directory, and its log file.
    /// A running machine is stopped first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the machine does not exist.
    fn delete(&self, ctx: &Context, name: &str) -> Result<()>;

    /// Fetches one machine, reconciling its status against the live VMM
    /// process first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown machines or ones owned by another
    /// platform.
    fn get(&self, ctx: &Context, name: &str) -> Result<Machine>;

    /// Lists this platform's machines, reconciled.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    fn list(&self, ctx: &Context) -> Result<Vec<Machine>>;

    /// Streams state transitions until the machine reaches a terminal
    /// state or the context is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown machines.
    fn watch(&self, ctx: &Context, name: &str) -> Result<EventStream>;

    /// Streams console log lines, following until terminal state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown machines or missing log files.
    fn logs(&self, ctx: &Context, name: &str) -> Result<LogStream>;
}

/// Store hook scoping a machine store to one platform.
///
/// Writes for a different platform are rejected; reads and listings of
/// foreign records behave as if the record did not exist.
pub struct PlatformFilter {
    platform: Platform,
}

impl PlatformFilter {
    /// Builds a filter owning `platform`.
    #[must_use]
    pub const fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl BeforeHook<Machine> for PlatformFilter {
    fn before(&self, op: Op, machine: &Machine) -> Result<Option<Machine>> {
        if machine.spec.platform == self.platform {
            return Ok(Some(machine.clone()));
        }
        if op == Op::Upsert {
            return Err(UnikitError::InvalidInput {
                message: format!(
                    "machine {} targets platform {}, store owns {}",
                    machine.name, machine.spec.platform, self.platform
                ),
            });
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unikit_common::types::MachineState;

    fn machine_on(platform: Platform) -> Machine {
        let mut machine = Machine::new("probe");
        machine.spec.platform = platform;
        machine.status.state = MachineState::Created;
        machine
    }

    #[test]
    fn filter_passes_matching_platform() {
        let filter = PlatformFilter::new(Platform::Qemu);
        let result = filter
            .before(Op::Get, &machine_on(Platform::Qemu))
            .expect("hook");
        assert!(result.is_some());
    }

    #[test]
    fn filter_rejects_foreign_writes() {
        let filter = PlatformFilter::new(Platform::Qemu);
        assert!(filter.before(Op::Upsert, &machine_on(Platform::Xen)).is_err());
    }

    #[test]
    fn filter_hides_foreign_reads_and_listings() {
        let filter = PlatformFilter::new(Platform::Qemu);
        for op in [Op::Get, Op::List, Op::Delete] {
            let result = filter.before(op, &machine_on(Platform::Xen)).expect("hook");
            assert!(result.is_none());
        }
    }
}
