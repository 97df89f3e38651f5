//! The canonical machine record and its state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::{Architecture, MachineId, MachineState, Platform};
use unikit_resources::network::NetworkInterface;
use unikit_resources::port::Port;
use unikit_resources::volume::Volume;
use unikit_store::StoredObject;

/// Memory (and later CPU) requests for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// Requested guest memory in bytes.
    pub memory: u64,
}

/// Resource envelope of a machine spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineResources {
    /// Guaranteed minimums.
    pub requests: ResourceRequests,
}

/// A network the machine is attached to, with the interface reserved for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedNetwork {
    /// Name of the owning network.
    pub network: String,
    /// The interface reserved on that network.
    pub interface: NetworkInterface,
}

/// Desired state of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Guest CPU architecture.
    pub architecture: Architecture,
    /// VMM platform the machine runs on.
    pub platform: Platform,
    /// Scheme-prefixed kernel locator, e.g. `kernel://hello_qemu-x86_64`.
    /// Never a host path; see `status.kernel_path` for that.
    pub kernel: String,
    /// Host path of the root filesystem archive, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    /// Arguments handed to the guest kernel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_args: Vec<String>,
    /// Arguments handed to the guest application.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_args: Vec<String>,
    /// Forwarded ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    /// Attached networks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<AttachedNetwork>,
    /// Mounted volumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Resource requests.
    #[serde(default)]
    pub resources: MachineResources,
    /// When true, hardware acceleration is disabled.
    #[serde(default)]
    pub emulation: bool,
    /// Environment variables exported to the guest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            architecture: Architecture::host().unwrap_or(Architecture::X86_64),
            platform: Platform::Unknown,
            kernel: String::new(),
            rootfs: None,
            kernel_args: Vec::new(),
            application_args: Vec::new(),
            ports: Vec::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
            resources: MachineResources::default(),
            emulation: false,
            env: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Observed state of a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle state.
    #[serde(default)]
    pub state: MachineState,
    /// PID of the VMM process while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Host path of the kernel image booted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_path: Option<PathBuf>,
    /// Host path of the initramfs, if one is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<PathBuf>,
    /// Exit code of the guest once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last start timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Exit timestamp once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    /// Per-UID state directory, set exactly once at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Path of the serial/console log file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Opaque driver-specific attributes.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub platform_config: serde_json::Map<String, Value>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// A machine with its identity and spec/status pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    /// Unique DNS-label name, unique across all platforms.
    pub name: String,
    /// Generated 128-bit identifier.
    pub uid: MachineId,
    /// Desired state.
    pub spec: MachineSpec,
    /// Observed state.
    pub status: MachineStatus,
}

impl Machine {
    /// Builds an empty machine record with a fresh UID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: MachineId::generate(),
            spec: MachineSpec::default(),
            status: MachineStatus::default(),
        }
    }
}

// The UID travels inside the spec document; the name is the file stem.
#[derive(Serialize, Deserialize)]
struct SpecDocument {
    uid: MachineId,
    #[serde(flatten)]
    spec: MachineSpec,
}

impl StoredObject for Machine {
    const KIND: &'static str = "machine";

    fn object_name(&self) -> &str {
        &self.name
    }

    fn to_documents(&self) -> Result<(Value, Value)> {
        let spec = serde_json::to_value(SpecDocument {
            uid: self.uid,
            spec: self.spec.clone(),
        })?;
        let status = serde_json::to_value(&self.status)?;
        Ok((spec, status))
    }

    fn from_documents(name: &str, spec: Value, status: Value) -> Result<Self> {
        let doc: SpecDocument = serde_json::from_value(spec)?;
        Ok(Self {
            name: name.to_string(),
            uid: doc.uid,
            spec: doc.spec,
            status: if status.is_null() {
                MachineStatus::default()
            } else {
                serde_json::from_value(status)?
            },
        })
    }
}

/// Lifecycle operations subject to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    /// Begin or resume guest execution.
    Start,
    /// Suspend guest execution in place.
    Pause,
    /// Shut the guest down.
    Stop,
    /// Remove the machine and its durable state.
    Delete,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Pause => write!(f, "pause"),
            Self::Stop => write!(f, "stop"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Checks an operation against the machine state machine.
///
/// `Delete` is legal from every state: deleting a running machine first
/// shuts it down, which the owning service performs before removal.
///
/// # Errors
///
/// Returns [`UnikitError::InvalidStateTransition`] when the arrows of the
/// state machine do not permit `op` from `current`.
pub fn ensure_transition(current: MachineState, op: LifecycleOp) -> Result<()> {
    let allowed = match op {
        LifecycleOp::Start => matches!(current, MachineState::Created | MachineState::Paused),
        LifecycleOp::Pause => current == MachineState::Running,
        LifecycleOp::Stop => current == MachineState::Running,
        LifecycleOp::Delete => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(UnikitError::InvalidStateTransition {
            current: current.to_string(),
            requested: op.to_string(),
        })
    }
}

/// A state transition observed on a machine, emitted by `Watch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    /// Machine name.
    pub name: String,
    /// State entered.
    pub state: MachineState,
    /// Exit code, when `state` is terminal.
    pub exit_code: Option<i32>,
}
