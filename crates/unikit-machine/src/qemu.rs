//! QEMU driver: command construction and exit-code mapping.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use unikit_common::error::{Result, UnikitError};
use unikit_common::types::{Architecture, Platform, Protocol};

use crate::machine::Machine;
use crate::platform::host_supports_kvm;
use crate::vmm::VmmDriver;

const MIB: u64 = 1024 * 1024;

/// Driver for `qemu-system-*`, with KVM acceleration when the host offers
/// it and the machine does not force emulation.
#[derive(Debug, Default)]
pub struct QemuDriver;

impl QemuDriver {
    /// Builds the QEMU driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn accelerated(machine: &Machine) -> bool {
        !machine.spec.emulation
            && host_supports_kvm()
            && Architecture::host() == Some(machine.spec.architecture)
    }
}

impl VmmDriver for QemuDriver {
    fn platform(&self) -> Platform {
        Platform::Qemu
    }

    fn find_binary(&self, machine: &Machine) -> Result<PathBuf> {
        let binary = machine.spec.architecture.qemu_binary();
        which::which(binary).map_err(|_| UnikitError::NotFound {
            kind: "QEMU binary",
            id: format!("{binary} — install qemu-system for {}", machine.spec.architecture),
        })
    }

    fn command(&self, binary: &Path, machine: &Machine) -> Result<Command> {
        let kernel = machine
            .status
            .kernel_path
            .as_ref()
            .ok_or_else(|| UnikitError::NotFound {
                kind: "kernel",
                id: machine.spec.kernel.clone(),
            })?;

        let machine_type = match machine.spec.architecture {
            Architecture::X86_64 => "q35",
            Architecture::Arm | Architecture::Arm64 => "virt",
        };
        let kvm = Self::accelerated(machine);
        let accel = if kvm { "kvm" } else { "tcg" };
        let mem_mib = machine.spec.resources.requests.memory.div_ceil(MIB);

        let mut cmd = Command::new(binary);
        let _ = cmd
            .args(["-machine", &format!("{machine_type},accel={accel}")])
            .args(["-cpu", if kvm { "host" } else { "max" }])
            .args(["-m", &format!("{mem_mib}M")])
            .args(["-kernel", &kernel.display().to_string()])
            .arg("-nographic")
            .arg("-no-reboot");

        // The debug-exit device carries the guest exit code out through the
        // QEMU process status on x86.
        if machine.spec.architecture == Architecture::X86_64 {
            let _ = cmd.args(["-device", "isa-debug-exit,iobase=0xf4,iosize=0x04"]);
        }

        if let Some(initrd) = &machine.status.initrd_path {
            let _ = cmd.args(["-initrd", &initrd.display().to_string()]);
        }

        let _ = cmd.args(["-append", &boot_cmdline(machine)]);

        if !machine.spec.ports.is_empty() || !machine.spec.networks.is_empty() {
            let mut netdev = String::from("user,id=net0");
            for port in &machine.spec.ports {
                let proto = match port.protocol {
                    Protocol::Tcp => "tcp",
                    Protocol::Udp => "udp",
                };
                let host_ip = if port.host_ip == "0.0.0.0" {
                    ""
                } else {
                    &port.host_ip
                };
                let _ = write!(
                    netdev,
                    ",hostfwd={proto}:{host_ip}:{}-:{}",
                    port.host_port, port.machine_port
                );
            }
            let mut device = String::from("virtio-net-pci,netdev=net0");
            let mac = machine
                .spec
                .ports
                .iter()
                .find_map(|p| p.mac_address.as_deref())
                .or_else(|| {
                    machine
                        .spec
                        .networks
                        .first()
                        .map(|n| n.interface.mac.as_str())
                });
            if let Some(mac) = mac {
                let _ = write!(device, ",mac={mac}");
            }
            let _ = cmd.args(["-netdev", &netdev, "-device", &device]);
        }

        for (index, volume) in machine.spec.volumes.iter().enumerate() {
            let mut fsdev = format!(
                "local,id=fs{index},path={},security_model=none",
                volume.spec.source
            );
            if volume.spec.read_only {
                fsdev.push_str(",readonly=on");
            }
            let _ = cmd.args([
                "-fsdev",
                &fsdev,
                "-device",
                &format!("virtio-9p-pci,fsdev=fs{index},mount_tag={}", volume.spec.destination),
            ]);
        }

        Ok(cmd)
    }

    fn guest_exit_code(&self, machine: &Machine, raw: i32) -> i32 {
        // isa-debug-exit reports (guest_code << 1) | 1 through the QEMU
        // exit status.
        if machine.spec.architecture == Architecture::X86_64 && raw % 2 == 1 {
            raw >> 1
        } else {
            raw
        }
    }
}

/// Joins kernel args, exported environment, and application args into the
/// `-append` boot command line. Application args follow the `--` separator.
fn boot_cmdline(machine: &Machine) -> String {
    let mut parts: Vec<String> = machine.spec.kernel_args.clone();
    for (key, value) in &machine.spec.env {
        parts.push(format!("{key}={value}"));
    }
    if !machine.spec.application_args.is_empty() {
        parts.push("--".into());
        parts.extend(machine.spec.application_args.iter().cloned());
    }
    parts.join(" ")
}
