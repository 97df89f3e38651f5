//! Machine lifecycle management.
//!
//! A machine is a unikernel guest driven by a virtual-machine monitor. This
//! crate holds the canonical [`machine::Machine`] record, the per-platform
//! [`service::MachineService`] contract, concrete QEMU and Firecracker
//! drivers built on a shared VMM supervisor, platform detection, and an
//! iterator service that fans operations out across every registered
//! platform.

pub mod iterator;
pub mod machine;
pub mod platform;
pub mod service;
pub mod vmm;

pub mod qemu;

#[cfg(target_os = "linux")]
pub mod firecracker;
