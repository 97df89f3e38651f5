//! Domain primitive types used across the unikit workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnikitError};

/// Unique 128-bit identifier for a machine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(uuid::Uuid);

impl MachineId {
    /// Generates a fresh random machine ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the canonical hyphenated form.
    #[must_use]
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Returns the first eight hex characters, used in narrow listings.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MachineId {
    type Err = UnikitError;

    fn from_str(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| UnikitError::InvalidInput {
                message: format!("invalid machine UID {s}: {e}"),
            })
    }
}

/// Guest CPU architectures a kernel image can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 64-bit x86.
    X86_64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
}

impl Architecture {
    /// All supported architectures.
    pub const ALL: [Self; 3] = [Self::X86_64, Self::Arm, Self::Arm64];

    /// The architecture of the host this process runs on, if supported.
    #[must_use]
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X86_64),
            "arm" => Some(Self::Arm),
            "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }

    /// The QEMU system binary name for this architecture.
    #[must_use]
    pub const fn qemu_binary(&self) -> &'static str {
        match self {
            Self::X86_64 => "qemu-system-x86_64",
            Self::Arm => "qemu-system-arm",
            Self::Arm64 => "qemu-system-aarch64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Arm => write!(f, "arm"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = UnikitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "arm" => Ok(Self::Arm),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            other => Err(UnikitError::InvalidInput {
                message: format!("unknown architecture: {other}"),
            }),
        }
    }
}

/// The closed set of virtual-machine monitor platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// QEMU, with or without KVM acceleration.
    Qemu,
    /// AWS Firecracker.
    #[serde(rename = "fc")]
    Firecracker,
    /// The Xen hypervisor.
    Xen,
    /// Platform could not be determined.
    Unknown,
}

impl Platform {
    /// Every concrete platform, in canonical iteration order.
    pub const ALL: [Self; 3] = [Self::Qemu, Self::Firecracker, Self::Xen];

    /// Recognised aliases for this platform's canonical name.
    #[must_use]
    pub const fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Qemu => &["kvm"],
            Self::Firecracker => &["firecracker"],
            Self::Xen | Self::Unknown => &[],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qemu => write!(f, "qemu"),
            Self::Firecracker => write!(f, "fc"),
            Self::Xen => write!(f, "xen"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Platform {
    type Err = UnikitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qemu" | "kvm" => Ok(Self::Qemu),
            "fc" | "firecracker" => Ok(Self::Firecracker),
            "xen" => Ok(Self::Xen),
            "unknown" => Ok(Self::Unknown),
            other => Err(UnikitError::InvalidInput {
                message: format!("unknown platform alias: {other}"),
            }),
        }
    }
}

/// Whether this host is itself virtualised with respect to a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    /// Running inside a guest of the detected platform.
    Guest,
    /// Running on a host capable of driving the detected platform.
    Host,
    /// Role could not be determined.
    Unknown,
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => write!(f, "guest"),
            Self::Host => write!(f, "host"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Lifecycle state of a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// State has not been observed yet.
    #[default]
    Unknown,
    /// Machine has been created but not started.
    Created,
    /// The VMM process is running the guest.
    Running,
    /// Guest execution is paused.
    Paused,
    /// Guest is suspended to disk.
    Suspended,
    /// Guest is restarting.
    Restarting,
    /// Guest exited on its own.
    Exited,
    /// The VMM crashed or the guest kernel panicked.
    Failed,
    /// The machine record itself is in an inconsistent state.
    Errored,
}

impl MachineState {
    /// Whether the machine can never leave this state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Failed | Self::Errored)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Suspended => write!(f, "suspended"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol.
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    /// User Datagram Protocol.
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = UnikitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(UnikitError::InvalidInput {
                message: format!("unknown protocol: {other}"),
            }),
        }
    }
}

/// Validates that `name` is a legal RFC-1123 DNS label.
///
/// Machine, network, and volume names all share this grammar.
///
/// # Errors
///
/// Returns [`UnikitError::InvalidInput`] if the name is empty, longer than
/// 63 characters, contains anything other than lowercase alphanumerics and
/// hyphens, or starts/ends with a hyphen.
pub fn validate_dns_label(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !name.starts_with(['-', '_'])
        && !name.ends_with(['-', '_']);
    if valid {
        Ok(())
    } else {
        Err(UnikitError::InvalidInput {
            message: format!("invalid name: {name} (expected a DNS label)"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_aliases_round_trip() {
        assert_eq!("kvm".parse::<Platform>().unwrap(), Platform::Qemu);
        assert_eq!("firecracker".parse::<Platform>().unwrap(), Platform::Firecracker);
        assert_eq!(Platform::Firecracker.to_string(), "fc");
        assert!("vbox".parse::<Platform>().is_err());
    }

    #[test]
    fn architecture_from_str_accepts_aarch64() {
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert_eq!(Architecture::Arm64.to_string(), "arm64");
    }

    #[test]
    fn terminal_states() {
        assert!(MachineState::Exited.is_terminal());
        assert!(MachineState::Failed.is_terminal());
        assert!(MachineState::Errored.is_terminal());
        assert!(!MachineState::Running.is_terminal());
        assert!(!MachineState::Paused.is_terminal());
    }

    #[test]
    fn protocol_default_is_tcp() {
        assert_eq!(Protocol::default(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
    }

    #[test]
    fn dns_label_validation() {
        assert!(validate_dns_label("happy-mandrill0").is_ok());
        assert!(validate_dns_label("").is_err());
        assert!(validate_dns_label("-leading").is_err());
        assert!(validate_dns_label("Upper").is_err());
        assert!(validate_dns_label(&"a".repeat(64)).is_err());
    }

    #[test]
    fn machine_id_short_is_eight_chars() {
        assert_eq!(MachineId::generate().short().len(), 8);
    }

    #[test]
    fn machine_id_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<MachineId>().is_err());
    }
}
