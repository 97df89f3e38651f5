//! The run pipeline.
//!
//! Given a heterogeneous positional argument — a package reference, a
//! project directory, a raw unikernel binary, or a Linux ELF — a runner
//! strategy is selected, a canonical machine description is materialised,
//! resources (ports, networks, volumes, rootfs, environment, name) are
//! composed onto it, and the machine is driven to the requested terminal
//! state.

pub mod elf;
pub mod kraftfile;
pub mod pipeline;
pub mod rootfs;
pub mod runner;
pub mod runners;
