//! Firecracker driver. Linux hosts only.

use std::path::{Path, PathBuf};
use std::process::Command;

use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Platform;

use crate::machine::Machine;
use crate::vmm::VmmDriver;

const MIB: u64 = 1024 * 1024;
const CONFIG_FILE: &str = "config.json";
const API_SOCKET: &str = "fc.sock";

/// Driver for the `firecracker` micro-VMM.
#[derive(Debug, Default)]
pub struct FirecrackerDriver;

impl FirecrackerDriver {
    /// Builds the Firecracker driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl VmmDriver for FirecrackerDriver {
    fn platform(&self) -> Platform {
        Platform::Firecracker
    }

    fn find_binary(&self, _machine: &Machine) -> Result<PathBuf> {
        which::which("firecracker").map_err(|_| UnikitError::NotFound {
            kind: "Firecracker binary",
            id: "firecracker — see github.com/firecracker-microvm/firecracker".into(),
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
        let state_dir =
            machine
                .status
                .state_dir
                .as_ref()
                .ok_or_else(|| UnikitError::Backend {
                    message: format!("machine {} has no state directory", machine.name),
                })?;

        let mut boot_args: Vec<String> = machine.spec.kernel_args.clone();
        for (key, value) in &machine.spec.env {
            boot_args.push(format!("{key}={value}"));
        }
        if !machine.spec.application_args.is_empty() {
            boot_args.push("--".into());
            boot_args.extend(machine.spec.application_args.iter().cloned());
        }

        let mut boot_source = serde_json::json!({
            "kernel_image_path": kernel,
            "boot_args": boot_args.join(" "),
        });
        if let Some(initrd) = &machine.status.initrd_path {
            boot_source["initrd_path"] = serde_json::json!(initrd);
        }

        let config = serde_json::json!({
            "boot-source": boot_source,
            "machine-config": {
                "vcpu_count": 1,
                "mem_size_mib": machine.spec.resources.requests.memory.div_ceil(MIB),
                "smt": false,
            },
            "drives": [],
        });

        let config_path = state_dir.join(CONFIG_FILE);
        std::fs::write(
            &config_path,
            serde_json::to_vec_pretty(&config).map_err(UnikitError::from)?,
        )
        .map_err(|e| UnikitError::io(&config_path, e))?;

        // A stale socket from a previous boot blocks the API server.
        let socket_path = state_dir.join(API_SOCKET);
        let _ = std::fs::remove_file(&socket_path);

        let mut cmd = Command::new(binary);
        let _ = cmd
            .args(["--api-sock", &socket_path.display().to_string()])
            .args(["--config-file", &config_path.display().to_string()])
            .args(["--id", &machine.name]);
        Ok(cmd)
    }

    fn guest_exit_code(&self, _machine: &Machine, raw: i32) -> i32 {
        raw
    }
}
