//! System-wide constants and default paths.

/// Default base directory for unikit runtime state.
pub const DEFAULT_RUNTIME_DIR: &str = "/var/lib/unikit";

/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "UNIKIT_RUNTIME_DIR";

/// Store kind for machine records.
pub const MACHINE_KIND: &str = "machinev1alpha1";

/// Store kind for network records.
pub const NETWORK_KIND: &str = "networkv1alpha1";

/// Store kind for volume records.
pub const VOLUME_KIND: &str = "volumev1alpha1";

/// Directory under the runtime dir holding host service wrapper metadata.
pub const SYSTEMD_DIR: &str = "systemd";

/// Smallest memory request a machine may make.
pub const MIN_MEMORY_BYTES: u64 = 1024 * 1024;

/// Default memory request when the user supplies none.
pub const DEFAULT_MEMORY_SPEC: &str = "64Mi";

/// Seconds a shutdown signal is given before escalating to SIGKILL.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Interval at which watch producers re-observe machine state.
pub const WATCH_POLL_INTERVAL_MS: u64 = 250;

/// Interval at which log followers re-read the log file.
pub const LOG_POLL_INTERVAL_MS: u64 = 200;

/// The only KVM API version the QEMU driver accepts.
pub const KVM_API_VERSION: i32 = 12;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "unikit";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "unikit";
