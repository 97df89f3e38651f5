//! Cross-platform machine service.
//!
//! Presents the [`MachineService`] contract over a map of per-platform
//! services. Single-object operations try each platform in deterministic
//! (sorted) order and return the first success; listings union every
//! platform's results.

use std::collections::BTreeMap;

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Platform;

use crate::machine::Machine;
use crate::service::{EventStream, LogStream, MachineService};

const ALL_FAILED: &str = "all iterated platforms failed";

/// A `MachineService` that fans each operation out across every registered
/// per-platform service.
pub struct PlatformIterator {
    services: BTreeMap<Platform, Box<dyn MachineService>>,
}

impl PlatformIterator {
    /// Builds an iterator over the given services.
    #[must_use]
    pub fn new(services: BTreeMap<Platform, Box<dyn MachineService>>) -> Self {
        Self { services }
    }

    /// The platforms this iterator spans, in iteration order.
    #[must_use]
    pub fn platforms(&self) -> Vec<Platform> {
        self.services.keys().copied().collect()
    }

    fn first_success<T>(
        &self,
        op: impl Fn(&dyn MachineService) -> Result<T>,
    ) -> Result<T> {
        let mut errors = Vec::new();
        for service in self.services.values() {
            match op(service.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) => errors.push(e),
            }
        }
        Err(UnikitError::aggregate(ALL_FAILED, errors))
    }
}

impl MachineService for PlatformIterator {
    fn platform(&self) -> Platform {
        Platform::Unknown
    }

    fn create(&self, ctx: &Context, machine: &Machine) -> Result<Machine> {
        self.first_success(|s| s.create(ctx, machine))
    }

    fn start(&self, ctx: &Context, name: &str) -> Result<Machine> {
        self.first_success(|s| s.start(ctx, name))
    }

    fn pause(&self, ctx: &Context, name: &str) -> Result<Machine> {
        self.first_success(|s| s.pause(ctx, name))
    }

    fn stop(&self, ctx: &Context, name: &str) -> Result<Machine> {
        self.first_success(|s| s.stop(ctx, name))
    }

    fn update(&self, ctx: &Context, machine: &Machine) -> Result<Machine> {
        self.first_success(|s| s.update(ctx, machine))
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.first_success(|s| s.delete(ctx, name))
    }

    fn get(&self, ctx: &Context, name: &str) -> Result<Machine> {
        self.first_success(|s| s.get(ctx, name))
    }

    fn list(&self, ctx: &Context) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        for (platform, service) in &self.services {
            match service.list(ctx) {
                Ok(mut list) => machines.append(&mut list),
                // Partial failures are swallowed but logged.
                Err(e) => {
                    tracing::warn!(platform = %platform, error = %e, "platform listing failed");
                }
            }
        }
        Ok(machines)
    }

    fn watch(&self, ctx: &Context, name: &str) -> Result<EventStream> {
        self.first_success(|s| s.watch(ctx, name))
    }

    fn logs(&self, ctx: &Context, name: &str) -> Result<LogStream> {
        self.first_success(|s| s.logs(ctx, name))
    }
}

#[cfg(test)]
mod tests {
    use unikit_common::types::{MachineState, Platform};

    use super::*;

    struct FixedService {
        platform: Platform,
        machines: Vec<Machine>,
    }

    impl FixedService {
        fn machine(&self, name: &str) -> Option<Machine> {
            self.machines.iter().find(|m| m.name == name).cloned()
        }
    }

    impl MachineService for FixedService {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn create(&self, _ctx: &Context, machine: &Machine) -> Result<Machine> {
            if machine.spec.platform == self.platform {
                Ok(machine.clone())
            } else {
                Err(UnikitError::InvalidInput {
                    message: format!("not {}", self.platform),
                })
            }
        }

        fn start(&self, ctx: &Context, name: &str) -> Result<Machine> {
            self.get(ctx, name)
        }

        fn pause(&self, ctx: &Context, name: &str) -> Result<Machine> {
            self.get(ctx, name)
        }

        fn stop(&self, ctx: &Context, name: &str) -> Result<Machine> {
            self.get(ctx, name)
        }

        fn update(&self, _ctx: &Context, machine: &Machine) -> Result<Machine> {
            Ok(machine.clone())
        }

        fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
            self.get(ctx, name).map(|_| ())
        }

        fn get(&self, _ctx: &Context, name: &str) -> Result<Machine> {
            self.machine(name).ok_or(UnikitError::NotFound {
                kind: "machine",
                id: name.to_string(),
            })
        }

        fn list(&self, _ctx: &Context) -> Result<Vec<Machine>> {
            Ok(self.machines.clone())
        }

        fn watch(&self, _ctx: &Context, name: &str) -> Result<EventStream> {
            let _ = self.machine(name).ok_or(UnikitError::NotFound {
                kind: "machine",
                id: name.to_string(),
            })?;
            let (_etx, erx) = std::sync::mpsc::channel();
            let (_xtx, xrx) = std::sync::mpsc::channel();
            Ok((erx, xrx))
        }

        fn logs(&self, _ctx: &Context, name: &str) -> Result<LogStream> {
            let _ = self.machine(name).ok_or(UnikitError::NotFound {
                kind: "machine",
                id: name.to_string(),
            })?;
            let (_ltx, lrx) = std::sync::mpsc::channel();
            let (_xtx, xrx) = std::sync::mpsc::channel();
            Ok((lrx, xrx))
        }
    }

    fn machine_on(platform: Platform, name: &str) -> Machine {
        let mut machine = Machine::new(name);
        machine.spec.platform = platform;
        machine.status.state = MachineState::Created;
        machine
    }

    fn iterator() -> PlatformIterator {
        let mut services: BTreeMap<Platform, Box<dyn MachineService>> = BTreeMap::new();
        let _ = services.insert(
            Platform::Qemu,
            Box::new(FixedService {
                platform: Platform::Qemu,
                machines: vec![machine_on(Platform::Qemu, "alpha")],
            }) as Box<dyn MachineService>,
        );
        let _ = services.insert(
            Platform::Firecracker,
            Box::new(FixedService {
                platform: Platform::Firecracker,
                machines: vec![machine_on(Platform::Firecracker, "bravo")],
            }) as Box<dyn MachineService>,
        );
        PlatformIterator::new(services)
    }

    #[test]
    fn get_returns_first_platform_that_knows_the_name() {
        let iter = iterator();
        let ctx = Context::background();
        assert_eq!(iter.get(&ctx, "alpha").expect("get").spec.platform, Platform::Qemu);
        assert_eq!(
            iter.get(&ctx, "bravo").expect("get").spec.platform,
            Platform::Firecracker
        );
    }

    #[test]
    fn all_failures_aggregate() {
        let iter = iterator();
        let err = iter.get(&Context::background(), "ghost").unwrap_err();
        assert!(err.to_string().starts_with(ALL_FAILED));
    }

    #[test]
    fn list_unions_platforms() {
        let iter = iterator();
        let names: Vec<String> = iter
            .list(&Context::background())
            .expect("list")
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"alpha".to_string()));
        assert!(names.contains(&"bravo".to_string()));
    }

    #[test]
    fn create_lands_on_the_matching_platform() {
        let iter = iterator();
        let machine = machine_on(Platform::Firecracker, "charlie");
        let stored = iter.create(&Context::background(), &machine).expect("create");
        assert_eq!(stored.spec.platform, Platform::Firecracker);
    }
}
