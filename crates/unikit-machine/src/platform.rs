//! Platform registry and host capability detection.

use std::collections::BTreeMap;

use unikit_common::config::RuntimeConfig;
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::{Platform, SystemMode};

use crate::iterator::PlatformIterator;
use crate::qemu::QemuDriver;
use crate::service::MachineService;
use crate::vmm::VmmService;

/// Constructor for a per-platform machine service.
pub type ServiceFactory = fn(&RuntimeConfig) -> Result<Box<dyn MachineService>>;

/// Every concrete platform, in canonical iteration order.
#[must_use]
pub fn platforms() -> Vec<Platform> {
    Platform::ALL.to_vec()
}

/// Canonical names and aliases mapped onto their platform.
#[must_use]
pub fn platforms_by_name() -> BTreeMap<String, Platform> {
    let mut map = BTreeMap::new();
    for platform in Platform::ALL {
        let _ = map.insert(platform.to_string(), platform);
        for alias in platform.aliases() {
            let _ = map.insert((*alias).to_string(), platform);
        }
    }
    map
}

/// Alias table keyed by platform.
#[must_use]
pub fn platform_aliases() -> BTreeMap<Platform, Vec<&'static str>> {
    Platform::ALL
        .into_iter()
        .map(|p| (p, p.aliases().to_vec()))
        .collect()
}

/// Machine service constructors for every platform this host can drive.
///
/// Firecracker requires a Linux host and is absent from the table
/// elsewhere.
#[must_use]
pub fn strategies() -> BTreeMap<Platform, ServiceFactory> {
    let mut map: BTreeMap<Platform, ServiceFactory> = BTreeMap::new();
    let _ = map.insert(Platform::Qemu, |config| {
        Ok(Box::new(VmmService::open(QemuDriver::new(), config)?) as Box<dyn MachineService>)
    });
    #[cfg(target_os = "linux")]
    let _ = map.insert(Platform::Firecracker, |config| {
        Ok(
            Box::new(VmmService::open(crate::firecracker::FirecrackerDriver::new(), config)?)
                as Box<dyn MachineService>,
        )
    });
    map
}

/// Builds the effective machine service for an optional platform choice.
///
/// A concrete platform yields that platform's service; `None` yields a
/// [`PlatformIterator`] over every registered platform.
///
/// # Errors
///
/// Returns `InvalidInput` if `platform` is not registered on this host.
pub fn service_for(
    config: &RuntimeConfig,
    platform: Option<Platform>,
) -> Result<Box<dyn MachineService>> {
    let table = strategies();
    match platform {
        Some(platform) => {
            let factory = table.get(&platform).ok_or_else(|| UnikitError::InvalidInput {
                message: format!("platform {platform} is not supported on this host"),
            })?;
            factory(config)
        }
        None => {
            let mut services = BTreeMap::new();
            for (platform, factory) in table {
                let _ = services.insert(platform, factory(config)?);
            }
            Ok(Box::new(PlatformIterator::new(services)))
        }
    }
}

/// Probes the host for the platform it can drive and the role it plays.
///
/// Probe order on Unix: Xen capabilities, loaded KVM modules, virtualised
/// CPU strings, the KVM device, and finally QEMU binaries on `PATH`.
/// Negative results are never cached; failures name the last-examined
/// source.
///
/// # Errors
///
/// Returns a backend error naming the probe that failed, or an
/// unconditional error on non-Unix hosts.
#[cfg(unix)]
pub fn detect(ctx: &Context) -> Result<(Platform, SystemMode)> {
    ctx.check()?;
    let mut last_source = "/proc/xen/capabilities";
    let mut last_error: Option<std::io::Error> = None;

    match std::fs::read_to_string("/proc/xen/capabilities") {
        Ok(capabilities) => {
            let mode = if capabilities.contains("control_d") {
                SystemMode::Host
            } else {
                SystemMode::Guest
            };
            return Ok((Platform::Xen, mode));
        }
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => last_error = Some(e),
        Err(_) => {}
    }

    ctx.check()?;
    match std::fs::read_to_string("/proc/modules") {
        Ok(modules) => {
            if modules.lines().any(|l| l.split_whitespace().next() == Some("kvm")) {
                return Ok((Platform::Qemu, SystemMode::Host));
            }
        }
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            last_source = "/proc/modules";
            last_error = Some(e);
        }
        Err(_) => {}
    }

    ctx.check()?;
    if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
        const VIRTUAL_CPUS: [&str; 3] = [
            "QEMU Virtual CPU",
            "Common KVM processor",
            "Common 32-bit KVM processor",
        ];
        if VIRTUAL_CPUS.iter().any(|s| cpuinfo.contains(s)) {
            return Ok((Platform::Qemu, SystemMode::Guest));
        }
    }

    ctx.check()?;
    if host_supports_kvm() {
        return Ok((Platform::Qemu, SystemMode::Host));
    }

    ctx.check()?;
    for binary in [
        "qemu-system-x86_64",
        "qemu-system-arm",
        "qemu-system-aarch64",
    ] {
        if which::which(binary).is_ok() {
            return Ok((Platform::Qemu, SystemMode::Guest));
        }
    }

    match last_error {
        Some(e) => Err(UnikitError::Backend {
            message: format!("platform detection failed at {last_source}: {e}"),
        }),
        None => Ok((Platform::Unknown, SystemMode::Unknown)),
    }
}

/// Platform detection is not available off Unix.
///
/// # Errors
///
/// Always returns a backend error.
#[cfg(not(unix))]
pub fn detect(_ctx: &Context) -> Result<(Platform, SystemMode)> {
    Err(UnikitError::Backend {
        message: "platform detection is not supported on this operating system".into(),
    })
}

/// Whether `/dev/kvm` is usable and speaks the supported KVM API version.
#[must_use]
#[cfg(target_os = "linux")]
pub fn host_supports_kvm() -> bool {
    kvm_api_version().is_some_and(|v| v == unikit_common::constants::KVM_API_VERSION)
}

/// KVM is a Linux-only facility.
#[must_use]
#[cfg(not(target_os = "linux"))]
pub fn host_supports_kvm() -> bool {
    false
}

#[cfg(target_os = "linux")]
fn kvm_api_version() -> Option<i32> {
    use std::os::fd::AsRawFd;

    const KVM_GET_API_VERSION: libc::c_ulong = 0xAE00;

    let device = std::fs::File::open("/dev/kvm").ok()?;
    // SAFETY: KVM_GET_API_VERSION takes no argument and only queries the
    // open descriptor.
    let version = unsafe { libc::ioctl(device.as_raw_fd(), KVM_GET_API_VERSION) };
    (version >= 0).then_some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_aliases() {
        let by_name = platforms_by_name();
        assert_eq!(by_name.get("kvm"), Some(&Platform::Qemu));
        assert_eq!(by_name.get("firecracker"), Some(&Platform::Firecracker));
        assert_eq!(by_name.get("qemu"), Some(&Platform::Qemu));
        assert_eq!(by_name.get("xen"), Some(&Platform::Xen));
    }

    #[test]
    fn alias_table_covers_all_platforms() {
        let aliases = platform_aliases();
        assert_eq!(aliases.len(), Platform::ALL.len());
        assert_eq!(aliases.get(&Platform::Qemu), Some(&vec!["kvm"]));
    }

    #[test]
    fn qemu_strategy_is_always_registered() {
        assert!(strategies().contains_key(&Platform::Qemu));
    }

    #[cfg(unix)]
    #[test]
    fn detect_honours_cancellation() {
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(detect(&ctx), Err(UnikitError::Canceled)));
    }
}
