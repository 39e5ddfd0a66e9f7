//! VirtualBox VMs driven through `VBoxManage`.
//!
//! [`VboxManage`] wraps the subcommands used for snapshot handling and is
//! shared with the cached Vagrant path. [`VirtualboxDriver`] restores one
//! fixed snapshot whenever a host is acquired and powers the VM off when it
//! is released.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFuture, BackendKind, HostAddress,
    InstanceHandle,
};
use crate::exec::{CommandLine, CommandOutput, CommandRunner, ExecError};
use crate::host_spec::VirtualboxSpec;

use super::run_tool;

const KIND: BackendKind = BackendKind::DesktopVm;
const NO_EXTRA_DATA: &str = "No value set!";
const SNAPSHOT_DESCRIPTION: &str = "Snapshot taken by overcast";

/// Machine states reported by `VBoxManage showvminfo`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VirtualboxState {
    /// Powered off.
    PowerOff,
    /// Suspended to disk.
    Saved,
    /// Stopped abnormally.
    Aborted,
    /// Up.
    Running,
}

impl VirtualboxState {
    /// Reads the state out of the `State:` line of `showvminfo` output.
    #[must_use]
    pub fn from_vm_info(output: &str) -> Option<Self> {
        let line = output
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("State:"))?;
        [
            ("powered off", Self::PowerOff),
            ("saved", Self::Saved),
            ("aborted", Self::Aborted),
            ("running", Self::Running),
        ]
        .into_iter()
        .find_map(|(needle, state)| line.contains(needle).then_some(state))
    }

    /// Whether a snapshot can be restored without powering off first.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::PowerOff | Self::Saved)
    }
}

/// Thin client for the `VBoxManage` command-line tool.
#[derive(Clone)]
pub struct VboxManage {
    bin: String,
    runner: Arc<dyn CommandRunner>,
}

impl VboxManage {
    /// Creates a client that runs `bin` through `runner`.
    #[must_use]
    pub fn new(bin: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            bin: bin.to_owned(),
            runner,
        }
    }

    async fn run(&self, arguments: &[&str]) -> Result<CommandOutput, ExecError> {
        let command = CommandLine::new(&self.bin).args(arguments.iter().copied());
        run_tool(self.runner.as_ref(), &command).await
    }

    fn unexpected(&self, output: CommandOutput, stderr: String) -> ExecError {
        ExecError::failure(&self.bin, &CommandOutput { stderr, ..output })
    }

    /// Current state of `vm`.
    ///
    /// # Errors
    ///
    /// Fails when the command fails or prints no recognizable state.
    pub async fn state(&self, vm: &str) -> Result<VirtualboxState, ExecError> {
        let output = self.run(&["showvminfo", vm]).await?;
        match VirtualboxState::from_vm_info(&output.stdout) {
            Some(state) => Ok(state),
            None => Err(self.unexpected(output, format!("no machine state reported for {vm}"))),
        }
    }

    /// Pulls the virtual power cord of `vm`.
    ///
    /// # Errors
    ///
    /// Fails when the command fails.
    pub async fn power_off(&self, vm: &str) -> Result<(), ExecError> {
        self.run(&["controlvm", vm, "poweroff"]).await.map(drop)
    }

    /// Powers `vm` off unless it is already stopped, restores `snapshot`,
    /// and starts it headless.
    ///
    /// # Errors
    ///
    /// Fails when any of the commands fails.
    pub async fn restore_snapshot(&self, vm: &str, snapshot: &str) -> Result<(), ExecError> {
        let state = self.state(vm).await?;
        if !state.is_stopped() {
            debug!(vm, ?state, "powering off before snapshot restore");
            self.power_off(vm).await?;
        }
        self.run(&["snapshot", vm, "restore", snapshot]).await?;
        self.run(&["startvm", vm, "--type", "headless"]).await.map(drop)
    }

    /// Restores the current snapshot of `vm` and starts it.
    ///
    /// # Errors
    ///
    /// Fails when `vm` has no snapshot or any command fails.
    pub async fn restore_current_snapshot(&self, vm: &str) -> Result<(), ExecError> {
        let output = self
            .run(&["snapshot", vm, "list", "--machinereadable"])
            .await?;
        let current = output.stdout.lines().find_map(|line| {
            line.trim()
                .strip_prefix("CurrentSnapshotUUID=")
                .map(|value| value.trim_matches('"').to_owned())
        });
        let Some(snapshot) = current else {
            return Err(self.unexpected(output, format!("{vm} has no current snapshot")));
        };
        self.restore_snapshot(vm, &snapshot).await
    }

    /// Takes a snapshot of `vm` named `name`.
    ///
    /// # Errors
    ///
    /// Fails when the command fails.
    pub async fn take_snapshot(&self, vm: &str, name: &str) -> Result<(), ExecError> {
        self.run(&["snapshot", vm, "take", name, "--description", SNAPSHOT_DESCRIPTION])
            .await
            .map(drop)
    }

    /// Reads the extradata entry `key` of `vm`.
    ///
    /// # Errors
    ///
    /// Fails when the command fails.
    pub async fn extra_data(&self, vm: &str, key: &str) -> Result<Option<String>, ExecError> {
        let output = self.run(&["getextradata", vm, key]).await?;
        let value = output.stdout.trim();
        if value == NO_EXTRA_DATA {
            return Ok(None);
        }
        Ok(Some(value.strip_prefix("Value: ").unwrap_or(value).to_owned()))
    }

    /// Sets the extradata entry `key` of `vm`.
    ///
    /// # Errors
    ///
    /// Fails when the command fails.
    pub async fn set_extra_data(&self, vm: &str, key: &str, value: &str) -> Result<(), ExecError> {
        self.run(&["setextradata", vm, key, value]).await.map(drop)
    }
}

impl fmt::Debug for VboxManage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VboxManage")
            .field("bin", &self.bin)
            .finish_non_exhaustive()
    }
}

/// Resets a VirtualBox VM to a snapshot for each use.
#[derive(Debug)]
pub struct VirtualboxDriver {
    spec: VirtualboxSpec,
    vbox: VboxManage,
}

impl VirtualboxDriver {
    /// Creates a driver for one VM.
    #[must_use]
    pub const fn new(spec: VirtualboxSpec, vbox: VboxManage) -> Self {
        Self { spec, vbox }
    }
}

impl Backend for VirtualboxDriver {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(async move {
            info!(vm = %self.spec.uuid, snapshot = %self.spec.snapshot, "restoring snapshot");
            self.vbox
                .restore_snapshot(&self.spec.uuid, &self.spec.snapshot)
                .await
                .map_err(|err| BackendError::creation(KIND, err))?;
            Ok(InstanceHandle::new(self.spec.uuid.clone()))
        })
    }

    fn address<'a>(&'a self, _handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move { Ok(AddressSource::Resolved(HostAddress::new(&self.spec.ip))) })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let destroy = |err: ExecError| BackendError::destroy(KIND, &handle.id, err);
            let state = self.vbox.state(&handle.id).await.map_err(destroy)?;
            if state != VirtualboxState::Running {
                return Err(BackendError::Gone {
                    kind: KIND,
                    id: handle.id.clone(),
                });
            }
            info!(vm = %handle.id, "powering off");
            self.vbox.power_off(&handle.id).await.map_err(destroy)
        })
    }
}
