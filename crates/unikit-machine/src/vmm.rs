//! Generic VMM-backed machine service.
//!
//! Everything the per-platform drivers share lives here: durable state
//! allocation, the state machine, process supervision, reconciliation of
//! externally crashed guests, and the watch/log channel producers. A
//! [`VmmDriver`] contributes only binary discovery, command construction,
//! and exit-code mapping.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use unikit_common::config::RuntimeConfig;
use unikit_common::constants::{
    LOG_POLL_INTERVAL_MS, MACHINE_KIND, MIN_MEMORY_BYTES, SHUTDOWN_GRACE_SECS,
    WATCH_POLL_INTERVAL_MS,
};
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::{MachineId, MachineState, Platform, validate_dns_label};
use unikit_store::Store;

use crate::machine::{LifecycleOp, Machine, MachineEvent, ensure_transition};
use crate::service::{EventStream, LogStream, MachineService, PlatformFilter};

/// Name of the per-machine console log inside the state directory.
const LOG_FILE: &str = "log";
/// File recording the guest exit code once the VMM terminates.
const EXITCODE_FILE: &str = "exitcode";

/// Platform-specific half of a machine service.
pub trait VmmDriver: Send + Sync + 'static {
    /// The platform this driver speaks for.
    fn platform(&self) -> Platform;

    /// Locates the VMM binary able to boot `machine`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the binary is not installed.
    fn find_binary(&self, machine: &Machine) -> Result<PathBuf>;

    /// Builds the spawn command for `machine`. May write support files
    /// (VMM configuration) into the machine's state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if required spec/status fields are missing.
    fn command(&self, binary: &Path, machine: &Machine) -> Result<Command>;

    /// Maps the raw VMM process exit status to the guest's exit code.
    fn guest_exit_code(&self, machine: &Machine, raw: i32) -> i32;
}

/// Machine service for one platform, backed by the object store and a
/// [`VmmDriver`].
pub struct VmmService<D: VmmDriver> {
    inner: Arc<Inner<D>>,
}

struct Inner<D: VmmDriver> {
    driver: D,
    config: RuntimeConfig,
    store: Store<Machine>,
}

impl<D: VmmDriver> VmmService<D> {
    /// Opens the platform-filtered machine store and wraps `driver`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the store directory cannot be created.
    pub fn open(driver: D, config: &RuntimeConfig) -> Result<Self> {
        let store = Store::open(config.kind_dir(MACHINE_KIND))?
            .with_hook(Box::new(PlatformFilter::new(driver.platform())));
        Ok(Self {
            inner: Arc::new(Inner {
                driver,
                config: config.clone(),
                store,
            }),
        })
    }
}

impl<D: VmmDriver> MachineService for VmmService<D> {
    fn platform(&self) -> Platform {
        self.inner.driver.platform()
    }

    fn create(&self, ctx: &Context, machine: &Machine) -> Result<Machine> {
        ctx.check()?;
        validate_dns_label(&machine.name)?;
        if machine.spec.resources.requests.memory < MIN_MEMORY_BYTES {
            return Err(UnikitError::InvalidInput {
                message: "memory must be at least 1Mi".into(),
            });
        }
        match self.inner.store.get(ctx, &machine.name) {
            Ok(_) => {
                return Err(UnikitError::Conflict {
                    message: "machine instance name already in use".into(),
                });
            }
            Err(UnikitError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let kernel_path =
            machine
                .status
                .kernel_path
                .as_ref()
                .ok_or_else(|| UnikitError::NotFound {
                    kind: "kernel",
                    id: machine.spec.kernel.clone(),
                })?;
        if !kernel_path.is_file() {
            return Err(UnikitError::NotFound {
                kind: "kernel",
                id: kernel_path.display().to_string(),
            });
        }

        // Create is the only operation that allocates durable state; the
        // guard rolls the directory back on any error below, panics
        // included.
        let mut machine = machine.clone();
        machine.uid = MachineId::generate();
        let state_dir = self.inner.config.state_dir(&machine.uid);
        create_state_dir(&state_dir)?;
        let guard = StateDirGuard::new(state_dir.clone());

        machine.status.state = MachineState::Created;
        machine.status.created_at = Some(Utc::now());
        machine.status.state_dir = Some(state_dir.clone());
        machine.status.log_file = Some(state_dir.join(LOG_FILE));

        let stored = self.inner.store.upsert(ctx, &machine)?;
        guard.disarm();
        tracing::info!(name = %stored.name, uid = %stored.uid, platform = %self.platform(), "machine created");
        Ok(stored)
    }

    fn start(&self, ctx: &Context, name: &str) -> Result<Machine> {
        ctx.check()?;
        let mut machine = self.inner.reconciled_get(ctx, name)?;
        ensure_transition(machine.status.state, LifecycleOp::Start)?;

        if machine.status.state == MachineState::Paused {
            let pid = require_pid(&machine)?;
            signal(pid, Signal::SIGCONT)?;
            machine.status.state = MachineState::Running;
            return self.inner.store.upsert(ctx, &machine);
        }

        let binary = self.inner.driver.find_binary(&machine)?;
        let mut command = self.inner.driver.command(&binary, &machine)?;
        let log_file = machine
            .status
            .log_file
            .clone()
            .ok_or_else(|| UnikitError::Backend {
                message: format!("machine {name} has no log file assigned"),
            })?;
        let log_out = open_log(&log_file)?;
        let log_err = log_out.try_clone().map_err(|e| UnikitError::io(&log_file, e))?;

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_out))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| UnikitError::Backend {
                message: format!("failed to spawn {}: {e}", binary.display()),
            })?;

        machine.status.pid = Some(child.id());
        machine.status.state = MachineState::Running;
        machine.status.started_at = Some(Utc::now());
        machine.status.exit_code = None;
        machine.status.exited_at = None;

        let stored = match self.inner.store.upsert(ctx, &machine) {
            Ok(stored) => stored,
            Err(e) => {
                // A VMM left alive after a failed start must not outlive
                // the error.
                let mut child = child;
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let inner = Arc::clone(&self.inner);
        let supervised = stored.clone();
        let _ = std::thread::spawn(move || inner.supervise(supervised, child));

        tracing::info!(name, pid = stored.status.pid, "machine started");
        Ok(stored)
    }

    fn pause(&self, ctx: &Context, name: &str) -> Result<Machine> {
        ctx.check()?;
        let mut machine = self.inner.reconciled_get(ctx, name)?;
        ensure_transition(machine.status.state, LifecycleOp::Pause)?;
        let pid = require_pid(&machine)?;
        signal(pid, Signal::SIGSTOP)?;
        machine.status.state = MachineState::Paused;
        let stored = self.inner.store.upsert(ctx, &machine)?;
        tracing::info!(name, "machine paused");
        Ok(stored)
    }

    fn stop(&self, ctx: &Context, name: &str) -> Result<Machine> {
        ctx.check()?;
        let machine = self.inner.reconciled_get(ctx, name)?;
        ensure_transition(machine.status.state, LifecycleOp::Stop)?;
        let stored = self.inner.shutdown(ctx, machine)?;
        tracing::info!(name, "machine stopped");
        Ok(stored)
    }

    fn update(&self, ctx: &Context, machine: &Machine) -> Result<Machine> {
        ctx.check()?;
        let stored = self.inner.store.get(ctx, &machine.name)?;
        let mut machine = machine.clone();
        // Identity and the state directory are immutable after creation.
        machine.uid = stored.uid;
        machine.status.state_dir = stored.status.state_dir;
        self.inner.store.upsert(ctx, &machine)
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.check()?;
        let machine = self.inner.reconciled_get(ctx, name)?;
        let machine = if machine.status.state == MachineState::Running {
            self.inner.shutdown(ctx, machine)?
        } else {
            machine
        };

        if let Some(state_dir) = &machine.status.state_dir {
            if state_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(state_dir) {
                    tracing::warn!(name, error = %e, "state directory cleanup failed");
                }
            }
        }
        self.inner.store.delete(ctx, name)?;
        tracing::info!(name, "machine deleted");
        Ok(())
    }

    fn get(&self, ctx: &Context, name: &str) -> Result<Machine> {
        self.inner.reconciled_get(ctx, name)
    }

    fn list(&self, ctx: &Context) -> Result<Vec<Machine>> {
        let mut machines = self.inner.store.list(ctx)?;
        for machine in &mut machines {
            if let Some(updated) = self.inner.reconcile(ctx, machine.clone()) {
                *machine = updated;
            }
        }
        Ok(machines)
    }

    fn watch(&self, ctx: &Context, name: &str) -> Result<EventStream> {
        let machine = self.inner.reconciled_get(ctx, name)?;
        let (event_tx, event_rx) = mpsc::channel();
        let (err_tx, err_rx) = mpsc::channel();

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let name = machine.name;
        let _ = std::thread::spawn(move || {
            let mut last: Option<MachineState> = None;
            loop {
                if ctx.is_cancelled() {
                    break;
                }
                let observed = match inner.reconciled_get(&ctx, &name) {
                    Ok(machine) => machine,
                    Err(e) => {
                        let _ = err_tx.send(e);
                        break;
                    }
                };
                let state = observed.status.state;
                if last != Some(state) {
                    last = Some(state);
                    let event = MachineEvent {
                        name: name.clone(),
                        state,
                        exit_code: observed.status.exit_code,
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                    if state.is_terminal() {
                        let _ = err_tx.send(UnikitError::MachineTerminated {
                            name: name.clone(),
                            state: state.to_string(),
                        });
                        break;
                    }
                }
                if ctx
                    .sleep(Duration::from_millis(WATCH_POLL_INTERVAL_MS))
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok((event_rx, err_rx))
    }

    fn logs(&self, ctx: &Context, name: &str) -> Result<LogStream> {
        let machine = self.inner.reconciled_get(ctx, name)?;
        let log_file = machine
            .status
            .log_file
            .clone()
            .ok_or_else(|| UnikitError::NotFound {
                kind: "log file",
                id: name.to_string(),
            })?;

        let (line_tx, line_rx) = mpsc::channel();
        let (err_tx, err_rx) = mpsc::channel();

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let name = machine.name;
        let _ = std::thread::spawn(move || {
            let mut position: u64 = 0;
            let mut partial = String::new();
            loop {
                if ctx.is_cancelled() {
                    break;
                }
                match read_appended(&log_file, position) {
                    Ok((chunk, new_position)) => {
                        position = new_position;
                        partial.push_str(&chunk);
                        while let Some(newline) = partial.find('\n') {
                            let line: String = partial.drain(..=newline).collect();
                            if line_tx.send(line.trim_end().to_string()).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(e);
                        break;
                    }
                }

                let observed_state = inner
                    .reconciled_get(&ctx, &name)
                    .map_or(MachineState::Errored, |m| m.status.state);
                if observed_state.is_terminal() {
                    // Flush whatever is left, then drain once more in case
                    // the VMM wrote between the read and the state check.
                    if let Ok((chunk, _)) = read_appended(&log_file, position) {
                        partial.push_str(&chunk);
                    }
                    if !partial.is_empty() {
                        let _ = line_tx.send(partial.trim_end().to_string());
                    }
                    let _ = err_tx.send(UnikitError::MachineTerminated {
                        name: name.clone(),
                        state: observed_state.to_string(),
                    });
                    break;
                }
                if ctx
                    .sleep(Duration::from_millis(LOG_POLL_INTERVAL_MS))
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok((line_rx, err_rx))
    }
}

impl<D: VmmDriver> Inner<D> {
    /// Fetches a machine and folds in what the host process table says.
    fn reconciled_get(&self, ctx: &Context, name: &str) -> Result<Machine> {
        let machine = self.store.get(ctx, name)?;
        Ok(self.reconcile(ctx, machine.clone()).unwrap_or(machine))
    }

    /// Detects a VMM that died behind our back and settles the record into
    /// `exited` or `failed`. Returns the updated machine when a write
    /// happened.
    fn reconcile(&self, ctx: &Context, mut machine: Machine) -> Option<Machine> {
        let observable = matches!(
            machine.status.state,
            MachineState::Running | MachineState::Paused | MachineState::Restarting
        );
        if !observable {
            return None;
        }
        let alive = machine.status.pid.is_some_and(process_alive);
        if alive {
            return None;
        }

        match read_exit_code(&machine) {
            Some(code) => {
                machine.status.state = MachineState::Exited;
                machine.status.exit_code = Some(code);
            }
            None => {
                machine.status.state = MachineState::Failed;
            }
        }
        machine.status.exited_at = Some(Utc::now());
        machine.status.pid = None;
        match self.store.upsert(ctx, &machine) {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::warn!(name = %machine.name, error = %e, "reconcile write failed");
                Some(machine)
            }
        }
    }

    /// SIGTERM, bounded grace, then SIGKILL; settles the record as exited.
    fn shutdown(&self, ctx: &Context, mut machine: Machine) -> Result<Machine> {
        let raw_pid = machine
            .status
            .pid
            .ok_or_else(|| UnikitError::Backend {
                message: format!("machine {} has no recorded VMM process", machine.name),
            })?;
        signal(to_pid(raw_pid), Signal::SIGTERM)?;

        let grace = ctx.with_timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS));
        while process_alive(raw_pid) {
            if grace.is_cancelled() {
                break;
            }
            let _ = grace.sleep(Duration::from_millis(100));
        }
        if process_alive(raw_pid) {
            tracing::warn!(name = %machine.name, pid = raw_pid, "grace period elapsed, sending SIGKILL");
            let _ = signal(to_pid(raw_pid), Signal::SIGKILL);
            while process_alive(raw_pid) {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        machine.status.state = MachineState::Exited;
        machine.status.exit_code = read_exit_code(&machine).or(Some(0));
        machine.status.exited_at = Some(Utc::now());
        machine.status.pid = None;
        self.store.upsert(ctx, &machine)
    }

    /// Waits on the spawned VMM and settles the record unless another
    /// operation already did.
    fn supervise(&self, machine: Machine, mut child: std::process::Child) {
        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(name = %machine.name, error = %e, "wait on VMM failed");
                return;
            }
        };

        let ctx = Context::background();
        let (state, exit_code) = match status.code() {
            Some(raw) => {
                let code = self.driver.guest_exit_code(&machine, raw);
                write_exit_code(&machine, code);
                (MachineState::Exited, Some(code))
            }
            None => (MachineState::Failed, None),
        };

        let Ok(mut current) = self.store.get(&ctx, &machine.name) else {
            return;
        };
        if !matches!(
            current.status.state,
            MachineState::Running | MachineState::Paused | MachineState::Restarting
        ) {
            return;
        }
        current.status.state = state;
        current.status.exit_code = exit_code;
        current.status.exited_at = Some(Utc::now());
        current.status.pid = None;
        if let Err(e) = self.store.upsert(&ctx, &current) {
            tracing::warn!(name = %machine.name, error = %e, "supervisor write failed");
        } else {
            tracing::debug!(name = %machine.name, state = %state, ?exit_code, "VMM terminated");
        }
    }
}

/// Removes a freshly created state directory unless disarmed.
struct StateDirGuard {
    path: PathBuf,
    armed: std::cell::Cell<bool>,
}

impl StateDirGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: std::cell::Cell::new(true),
        }
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for StateDirGuard {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

fn create_state_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| UnikitError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o2775);
        std::fs::set_permissions(path, perms).map_err(|e| UnikitError::io(path, e))?;
    }
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| UnikitError::io(path, e))
}

fn read_appended(path: &Path, position: u64) -> Result<(String, u64)> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        // The VMM may not have created the log yet.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((String::new(), position));
        }
        Err(e) => return Err(UnikitError::io(path, e)),
    };
    let len = file
        .metadata()
        .map_err(|e| UnikitError::io(path, e))?
        .len();
    if len <= position {
        return Ok((String::new(), position));
    }
    let _ = file
        .seek(SeekFrom::Start(position))
        .map_err(|e| UnikitError::io(path, e))?;
    let mut chunk = String::new();
    let _ = file
        .read_to_string(&mut chunk)
        .map_err(|e| UnikitError::io(path, e))?;
    Ok((chunk, len))
}

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX))
}

fn require_pid(machine: &Machine) -> Result<Pid> {
    machine
        .status
        .pid
        .map(to_pid)
        .ok_or_else(|| UnikitError::Backend {
            message: format!("machine {} has no recorded VMM process", machine.name),
        })
}

fn process_alive(pid: u32) -> bool {
    match kill(to_pid(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn signal(pid: Pid, sig: Signal) -> Result<()> {
    kill(pid, sig).map_err(|e| UnikitError::Backend {
        message: format!("failed to signal pid {pid}: {e}"),
    })
}

fn exit_code_path(machine: &Machine) -> Option<PathBuf> {
    machine
        .status
        .state_dir
        .as_ref()
        .map(|dir| dir.join(EXITCODE_FILE))
}

fn read_exit_code(machine: &Machine) -> Option<i32> {
    let path = exit_code_path(machine)?;
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn write_exit_code(machine: &Machine, code: i32) {
    if let Some(path) = exit_code_path(machine) {
        if let Ok(mut file) = std::fs::File::create(&path) {
            let _ = write!(file, "{code}");
        }
    }
}
