//! SSH port forwarding to freshly created hosts.
//!
//! A tunnel forwards local ports to ports on the target host and lives
//! exactly as long as the host handle that owns it: dropping or closing the
//! [`Tunnel`] kills the forwarding process.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::exec::{RemoteTarget, SshSettings};
use crate::wait::{PollPolicy, poll_until};

const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const CHECK_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// One `local:remote` forwarding rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortForward {
    /// Port opened on the local machine.
    pub local: u16,
    /// Port on the target host.
    pub remote: u16,
}

impl FromStr for PortForward {
    type Err = TunnelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || TunnelError::InvalidPorts(value.to_owned());
        let (local, remote) = value.trim().split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            local: local.trim().parse().map_err(|_| invalid())?,
            remote: remote.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Parses a comma separated list such as `2222:22,1445:445`.
///
/// # Errors
///
/// Returns [`TunnelError::InvalidPorts`] for malformed entries or when the
/// list is empty.
pub fn parse_port_forwards(value: &str) -> Result<Vec<PortForward>, TunnelError> {
    let forwards = value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<PortForward>, _>>()?;
    if forwards.is_empty() {
        return Err(TunnelError::InvalidPorts(value.to_owned()));
    }
    Ok(forwards)
}

/// Parameters for one tunnel.
#[derive(Clone, Eq, PartialEq)]
pub struct TunnelSpec {
    /// Login user on the target host.
    pub username: String,
    /// Password for `username`; key-based login is used when absent.
    pub password: Option<String>,
    /// Forwarding rules in configuration order.
    pub ports: Vec<PortForward>,
    /// Time allowed for every local port to accept connections. Zero skips
    /// the readiness wait.
    pub setup_timeout: Duration,
}

impl fmt::Debug for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSpec")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("ports", &self.ports)
            .field("setup_timeout", &self.setup_timeout)
            .finish()
    }
}

/// Errors raised while establishing tunnels.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// The port list is malformed.
    #[error("invalid tunnel ports {0:?}: expected local:remote[,local:remote...]")]
    InvalidPorts(String),
    /// The forwarding process could not be started.
    #[error("failed to start tunnel to {host}: {message}")]
    Launch {
        /// Target host.
        host: String,
        /// Spawn error text.
        message: String,
    },
    /// The local ports did not accept connections in time.
    #[error("tunnel to {host} not ready after {}s: {last_error}", timeout.as_secs())]
    SetupTimeout {
        /// Target host.
        host: String,
        /// Configured setup timeout.
        timeout: Duration,
        /// Last failed port check.
        last_error: String,
    },
}

/// A running forwarding process.
pub trait TunnelProcess: Send + Sync + fmt::Debug {
    /// Stops forwarding. Safe to call more than once.
    fn close(&mut self);

    /// Whether the process has stopped on its own, for example because the
    /// SSH connection was refused while the host was still booting.
    fn has_exited(&mut self) -> bool;
}

/// Future returned by tunnel port checks.
pub type PortCheckFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Starts forwarding processes and checks that they accept connections.
pub trait TunnelLauncher: Send + Sync {
    /// Starts forwarding `spec.ports` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Launch`] when the process cannot start.
    fn launch(
        &self,
        target: &RemoteTarget,
        spec: &TunnelSpec,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError>;

    /// Attempts one connection to the given local port.
    fn check_port(&self, local_port: u16) -> PortCheckFuture<'_>;
}

/// An established tunnel. Dropping it stops forwarding.
#[derive(Debug)]
pub struct Tunnel {
    forwards: Vec<PortForward>,
    process: Box<dyn TunnelProcess>,
}

impl Tunnel {
    /// Forwarding rules served by this tunnel.
    #[must_use]
    pub fn forwards(&self) -> &[PortForward] {
        &self.forwards
    }

    /// Local port forwarded to `remote`, if any.
    #[must_use]
    pub fn local_port(&self, remote: u16) -> Option<u16> {
        self.forwards
            .iter()
            .find(|forward| forward.remote == remote)
            .map(|forward| forward.local)
    }

    /// Stops forwarding.
    pub fn close(&mut self) {
        self.process.close();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.process.close();
    }
}

/// Establishes tunnels with a bounded setup time.
#[derive(Debug)]
pub struct TunnelManager<L> {
    launcher: L,
    check_interval: Duration,
}

impl<L: TunnelLauncher> TunnelManager<L> {
    /// Creates a manager around `launcher`.
    #[must_use]
    pub const fn new(launcher: L) -> Self {
        Self {
            launcher,
            check_interval: CHECK_INTERVAL,
        }
    }

    /// Starts forwarding to `host` and waits until every local port accepts
    /// connections or the setup timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Launch`] when the process cannot start, or
    /// [`TunnelError::SetupTimeout`] when the ports never become reachable.
    /// The process is stopped before a timeout is reported.
    pub async fn establish(&self, host: &str, spec: &TunnelSpec) -> Result<Tunnel, TunnelError> {
        let target = RemoteTarget {
            user: Some(spec.username.clone()),
            password: spec.password.clone(),
            ..RemoteTarget::new(host)
        };
        let process = self.launcher.launch(&target, spec)?;
        let mut tunnel = Tunnel {
            forwards: spec.ports.clone(),
            process,
        };

        if spec.setup_timeout.is_zero() {
            debug!(host, "tunnel setup timeout is zero; skipping readiness wait");
            return Ok(tunnel);
        }

        let policy = PollPolicy::new(spec.setup_timeout, self.check_interval);
        let ready = poll_until("tunnel setup", policy, |_| {
            let running = self.relaunch_if_exited(&target, spec, &mut tunnel);
            async move {
                running?;
                self.check_all(&spec.ports).await
            }
        })
        .await;
        match ready {
            Ok(()) => {
                info!(host, ports = spec.ports.len(), "tunnel established");
                Ok(tunnel)
            }
            Err(exhausted) => {
                tunnel.close();
                Err(TunnelError::SetupTimeout {
                    host: host.to_owned(),
                    timeout: spec.setup_timeout,
                    last_error: exhausted.describe_last(),
                })
            }
        }
    }

    /// Replaces a forwarding process that has already stopped and fails the
    /// attempt so the new process gets one interval before it is checked.
    /// SSH gives up at once when the host refuses connections, so a tunnel
    /// started against a booting host has to be started again.
    fn relaunch_if_exited(
        &self,
        target: &RemoteTarget,
        spec: &TunnelSpec,
        tunnel: &mut Tunnel,
    ) -> Result<(), String> {
        if !tunnel.process.has_exited() {
            return Ok(());
        }
        debug!(host = %target.host, "tunnel process exited; starting it again");
        tunnel.process.close();
        tunnel.process = self
            .launcher
            .launch(target, spec)
            .map_err(|err| err.to_string())?;
        Err(String::from("tunnel process exited and was started again"))
    }

    async fn check_all(&self, forwards: &[PortForward]) -> Result<Option<()>, String> {
        for forward in forwards {
            self.launcher
                .check_port(forward.local)
                .await
                .map_err(|err| format!("local port {}: {err}", forward.local))?;
        }
        Ok(Some(()))
    }
}

/// Launches `ssh -N -L` processes.
#[derive(Clone, Debug, Default)]
pub struct SshTunnelLauncher {
    settings: SshSettings,
}

impl SshTunnelLauncher {
    /// Creates a launcher using the given SSH client settings.
    #[must_use]
    pub const fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

impl TunnelLauncher for SshTunnelLauncher {
    fn launch(
        &self,
        target: &RemoteTarget,
        spec: &TunnelSpec,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let mut line = self
            .settings
            .command_for(&self.settings.ssh_bin, target)
            .arg("-N")
            .args(["-o", "ExitOnForwardFailure=yes", "-o", "RequestTTY=no"])
            .args(self.settings.common_options(target, "-p"));
        for forward in &spec.ports {
            line = line
                .arg("-L")
                .arg(format!("{}:localhost:{}", forward.local, forward.remote));
        }
        line = line.arg(target.destination());

        debug!(command = %line.display(), "spawning ssh tunnel");
        let mut command = tokio::process::Command::new(line.program());
        command
            .args(line.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in line.envs() {
            command.env(key, value);
        }
        let child = command.spawn().map_err(|err| TunnelError::Launch {
            host: target.host.clone(),
            message: err.to_string(),
        })?;
        Ok(Box::new(SshTunnelProcess { child }))
    }

    fn check_port(&self, local_port: u16) -> PortCheckFuture<'_> {
        Box::pin(async move {
            match timeout(
                CHECK_CONNECT_TIMEOUT,
                TcpStream::connect(("127.0.0.1", local_port)),
            )
            .await
            {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(String::from("connection attempt timed out")),
            }
        })
    }
}

#[derive(Debug)]
struct SshTunnelProcess {
    child: tokio::process::Child,
}

impl TunnelProcess for SshTunnelProcess {
    fn close(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "tunnel process already exited");
        }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}
