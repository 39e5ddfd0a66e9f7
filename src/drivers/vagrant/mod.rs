//! Desktop VMs managed through the `vagrant` command-line client.
//!
//! The state a box is in before it is brought up is recorded on the
//! instance handle so teardown can return it there: a box that was powered
//! off is halted again, a box that did not exist is destroyed, and so on.
//!
//! With a snapshot expiration command the box is cached instead. The
//! command's output is a tag kept in the VirtualBox extradata of the VM
//! next to a snapshot taken right after the first `vagrant up`. While the
//! tag matches, acquiring the box restores that snapshot; a changed tag
//! destroys the box and builds it again. Teardown of a cached box only
//! powers it off.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFuture, BackendKind, HostAddress,
    InstanceHandle,
};
use crate::exec::{CommandLine, CommandOutput, CommandRunner, ExecError, local_shell};
use crate::host_spec::VagrantSpec;
use crate::wait::{PollPolicy, poll_until};

use super::run_tool;
use super::virtualbox::{VboxManage, VirtualboxState};

const KIND: BackendKind = BackendKind::DesktopVm;
const INITIAL_STATE_KEY: &str = "initial_state";
/// Extradata key holding the expiration tag of a cached box.
pub const EXPIRATION_TAG_KEY: &str = "overcastExpirationTag";
const SSH_PORT: u16 = 22;
const RESTORED_BOOT: PollPolicy =
    PollPolicy::new(Duration::from_secs(200), Duration::from_secs(2));

/// Lifecycle states reported by `vagrant status`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VagrantState {
    /// The machine does not exist.
    NotCreated,
    /// The machine is powered off.
    PowerOff,
    /// The machine was stopped abnormally.
    Aborted,
    /// The machine is suspended.
    Saved,
    /// The machine is up.
    Running,
}

impl VagrantState {
    /// Reads the state out of `vagrant status` output.
    #[must_use]
    pub fn from_status(output: &str) -> Option<Self> {
        [
            ("not created", Self::NotCreated),
            ("poweroff", Self::PowerOff),
            ("aborted", Self::Aborted),
            ("saved", Self::Saved),
            ("running", Self::Running),
        ]
        .into_iter()
        .find_map(|(needle, state)| output.contains(needle).then_some(state))
    }

    /// Arguments that move a machine into this state, or `None` when no
    /// transition is needed or possible.
    #[must_use]
    pub const fn restore_arguments(self) -> Option<&'static [&'static str]> {
        match self {
            Self::NotCreated => Some(&["destroy", "-f"]),
            Self::PowerOff => Some(&["halt"]),
            Self::Saved => Some(&["suspend"]),
            Self::Running | Self::Aborted => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::NotCreated => "not created",
            Self::PowerOff => "poweroff",
            Self::Aborted => "aborted",
            Self::Saved => "saved",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for VagrantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VagrantState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_status(value).ok_or_else(|| format!("unknown vagrant state: {value}"))
    }
}

/// Brings a Vagrant box up and returns it to its previous state afterwards.
pub struct VagrantDriver {
    spec: VagrantSpec,
    vagrant_bin: String,
    vbox: VboxManage,
    runner: Arc<dyn CommandRunner>,
    ssh_port: u16,
}

impl VagrantDriver {
    /// Creates a driver for one box; `vbox` reaches the VirtualBox VM
    /// behind it when the box is cached.
    #[must_use]
    pub fn new(
        spec: VagrantSpec,
        vagrant_bin: &str,
        vbox: VboxManage,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            spec,
            vagrant_bin: vagrant_bin.to_owned(),
            vbox,
            runner,
            ssh_port: SSH_PORT,
        }
    }

    /// Overrides the port awaited after a cached box is restored.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    fn vagrant<I, S>(&self, arguments: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        CommandLine::new(&self.vagrant_bin)
            .args(arguments)
            .current_dir(self.spec.dir.clone())
    }

    /// Runs vagrant and rejects output carrying provisioner errors, which
    /// vagrant does not reflect in its exit code.
    async fn run_vagrant(&self, command: CommandLine) -> Result<CommandOutput, ExecError> {
        let output = run_tool(self.runner.as_ref(), &command).await?;
        if let Some(line) = provisioner_error(&output.stdout) {
            let stderr = format!("provisioner error: {line}");
            return Err(ExecError::failure(
                &self.vagrant_bin,
                &CommandOutput { stderr, ..output },
            ));
        }
        Ok(output)
    }

    async fn state(&self) -> Result<VagrantState, ExecError> {
        let output = self
            .run_vagrant(self.vagrant(["status", self.spec.vm.as_str()]))
            .await?;
        output.stdout.parse().map_err(|stderr| {
            ExecError::failure(
                &self.vagrant_bin,
                &CommandOutput {
                    stderr,
                    ..output.clone()
                },
            )
        })
    }

    fn up_command(&self) -> CommandLine {
        self.vagrant(["up", "--provision"])
            .args(self.spec.parameters.iter().map(String::as_str))
            .arg(&self.spec.vm)
    }

    /// Runs `vagrant up`, returning the box to where it was on failure.
    async fn bring_up(&self) -> Result<InstanceHandle, BackendError> {
        let initial = self
            .state()
            .await
            .map_err(|err| BackendError::creation(KIND, err))?;
        info!(vm = %self.spec.vm, state = %initial, "vagrant box state before up");

        if let Err(err) = self.run_vagrant(self.up_command()).await {
            if let Some(arguments) = initial.restore_arguments() {
                let restore = self
                    .vagrant(arguments.iter().copied())
                    .arg(&self.spec.vm);
                if let Err(cleanup) = self.run_vagrant(restore).await {
                    warn!(vm = %self.spec.vm, error = %cleanup, "could not restore box after failed up");
                }
            }
            return Err(BackendError::creation(KIND, err));
        }

        Ok(InstanceHandle::new(self.spec.vm.clone())
            .with_metadata(INITIAL_STATE_KEY, initial.as_str()))
    }

    async fn expiration_tag(&self, expiration: &str) -> Result<String, ExecError> {
        let command = local_shell(expiration).current_dir(self.spec.dir.clone());
        let output = run_tool(self.runner.as_ref(), &command).await?;
        Ok(output.stdout.trim().to_owned())
    }

    async fn destroy_box(&self) -> Result<(), ExecError> {
        self.run_vagrant(self.vagrant(["destroy", "-f"]).arg(&self.spec.vm))
            .await
            .map(drop)
    }

    /// Restores the snapshot of a cached box whose tag still matches, or
    /// builds the box from scratch and snapshots it.
    async fn create_cached(&self, expiration: &str) -> Result<InstanceHandle, BackendError> {
        let creation = |err: ExecError| BackendError::creation(KIND, err);
        let vm = self.spec.vm.as_str();

        let tag = self.expiration_tag(expiration).await.map_err(creation)?;
        info!(vm, tag, "computed expiration tag");

        if self.state().await.map_err(creation)? != VagrantState::NotCreated {
            let stored = self
                .vbox
                .extra_data(vm, EXPIRATION_TAG_KEY)
                .await
                .map_err(creation)?;
            if stored.as_deref() == Some(tag.as_str()) {
                info!(vm, "expiration tag matches; restoring the cached snapshot");
                self.vbox.restore_current_snapshot(vm).await.map_err(creation)?;
                self.wait_until_reachable().await?;
                return Ok(InstanceHandle::new(vm));
            }
            info!(vm, stored = ?stored, "expiration tag changed; recreating the box");
            self.destroy_box().await.map_err(creation)?;
        }

        let handle = self.bring_up().await?;
        if let Err(err) = self.snapshot(&tag).await {
            if let Err(cleanup) = self.destroy_box().await {
                warn!(vm, error = %cleanup, "could not destroy box after failed snapshot");
            }
            return Err(creation(err));
        }
        Ok(handle)
    }

    async fn snapshot(&self, tag: &str) -> Result<(), ExecError> {
        let vm = self.spec.vm.as_str();
        self.vbox.set_extra_data(vm, EXPIRATION_TAG_KEY, tag).await?;
        info!(vm, tag, "taking snapshot for later runs");
        self.vbox.take_snapshot(vm, tag).await
    }

    async fn wait_until_reachable(&self) -> Result<(), BackendError> {
        let target = (self.spec.ip.as_str(), self.ssh_port);
        poll_until("restored box", RESTORED_BOOT, |attempt| async move {
            debug!(vm = %self.spec.vm, attempt, "waiting for restored box");
            TcpStream::connect(target).await.map(|_| Some(()))
        })
        .await
        .map_err(|exhausted| {
            BackendError::creation(
                KIND,
                format!(
                    "box {} not reachable on port {} after restore: {}",
                    self.spec.vm,
                    self.ssh_port,
                    exhausted.describe_last()
                ),
            )
        })
    }

    /// Powers a cached box off, leaving it and its snapshot in place.
    async fn power_off_cached(&self, handle: &InstanceHandle) -> Result<(), BackendError> {
        let destroy = |err: ExecError| BackendError::destroy(KIND, &handle.id, err);
        let state = self.vbox.state(&handle.id).await.map_err(destroy)?;
        if state != VirtualboxState::Running {
            return Err(BackendError::Gone {
                kind: KIND,
                id: handle.id.clone(),
            });
        }
        info!(vm = %handle.id, "powering off cached box");
        self.vbox.power_off(&handle.id).await.map_err(destroy)
    }
}

/// Finds a provisioner error line (`err:`), ignoring terminal colour codes.
fn provisioner_error(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|line| {
        let plain = line
            .trim_start_matches('\u{1b}')
            .trim_start_matches(|ch: char| ch == '[' || ch == ';' || ch.is_ascii_digit())
            .trim_start_matches('m');
        plain.starts_with("err:")
    })
}

impl fmt::Debug for VagrantDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VagrantDriver")
            .field("spec", &self.spec)
            .field("vagrant_bin", &self.vagrant_bin)
            .finish_non_exhaustive()
    }
}

impl Backend for VagrantDriver {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(async move {
            match &self.spec.snapshot_expiration_cmd {
                Some(expiration) => self.create_cached(expiration).await,
                None => self.bring_up().await,
            }
        })
    }

    fn address<'a>(&'a self, _handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move { Ok(AddressSource::Resolved(HostAddress::new(&self.spec.ip))) })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if self.spec.snapshot_expiration_cmd.is_some() {
                let tag = self
                    .vbox
                    .extra_data(&handle.id, EXPIRATION_TAG_KEY)
                    .await
                    .map_err(|err| BackendError::destroy(KIND, &handle.id, err))?;
                if tag.is_some() {
                    return self.power_off_cached(handle).await;
                }
                debug!(vm = %handle.id, "no expiration tag; restoring the initial state");
            }

            let initial = handle
                .metadata
                .get(INITIAL_STATE_KEY)
                .and_then(|state| VagrantState::from_status(state))
                .unwrap_or(VagrantState::NotCreated);
            let current = self
                .state()
                .await
                .map_err(|err| BackendError::destroy(KIND, &handle.id, err))?;
            if current == initial {
                return Err(BackendError::Gone {
                    kind: KIND,
                    id: handle.id.clone(),
                });
            }
            let Some(arguments) = initial.restore_arguments() else {
                return Ok(());
            };

            info!(vm = %handle.id, state = %initial, "returning vagrant box to its initial state");
            self.run_vagrant(self.vagrant(arguments.iter().copied()).arg(&handle.id))
                .await
                .map(drop)
                .map_err(|err| BackendError::destroy(KIND, &handle.id, err))
        })
    }
}
