//! Local and remote command execution.
//!
//! Every backend driver, the address resolver, and the provisioning engine
//! talk to the outside world through the [`CommandRunner`] and
//! [`RemoteExecutor`] seams defined here, so tests can script outcomes
//! without spawning processes.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

mod ssh;
mod target;

pub use ssh::{SshExecutor, SshSettings};
pub use target::RemoteTarget;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns the first non-empty line of standard output, trimmed.
    #[must_use]
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }

    /// Converts a non-zero exit into [`ExecError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::CommandFailure`] when the exit code is not zero.
    pub fn into_success(self, program: &str) -> Result<Self, ExecError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ExecError::failure(program, &self))
    }
}

/// A fully described local process invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    current_dir: Option<Utf8PathBuf>,
}

impl CommandLine {
    /// Starts a command line for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Runs the process from `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Environment overrides applied to the child.
    #[must_use]
    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// Working directory override, if any.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Utf8Path> {
        self.current_dir.as_deref()
    }

    /// Renders the command as a single shell-like string for logs and
    /// assertions. Environment values are not included.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Errors surfaced while executing commands locally or remotely.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the remote transport could not reach the target.
    #[error("could not connect to {target}: {message}")]
    Connection {
        /// Host the connection was attempted against.
        target: String,
        /// Transport error text.
        message: String,
    },
    /// Raised when a connection descriptor cannot be parsed.
    #[error("invalid connection url {url}: {message}")]
    InvalidTarget {
        /// The rejected URL.
        url: String,
        /// Parse failure description.
        message: String,
    },
}

impl ExecError {
    /// Builds a [`ExecError::CommandFailure`] from a captured output.
    #[must_use]
    pub fn failure(program: &str, output: &CommandOutput) -> Self {
        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Self::CommandFailure {
            program: program.to_owned(),
            status: output.code,
            status_text,
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Future returned by command execution.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ExecError>> + Send + 'a>>;

/// Abstraction over local command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the command, capturing stdout and stderr.
    ///
    /// A non-zero exit is reported through [`CommandOutput::code`], not as an
    /// error; only spawn failures are errors.
    fn run<'a>(&'a self, command: &'a CommandLine) -> ExecFuture<'a, CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run<'a>(&'a self, command: &'a CommandLine) -> ExecFuture<'a, CommandOutput> {
        (**self).run(command)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, command: &'a CommandLine) -> ExecFuture<'a, CommandOutput> {
        Box::pin(async move {
            debug!(command = %command.display(), "running local command");
            let mut process = tokio::process::Command::new(command.program());
            process
                .args(command.arguments())
                .stdin(Stdio::null())
                .kill_on_drop(true);
            for (key, value) in command.envs() {
                process.env(key, value);
            }
            if let Some(dir) = command.working_dir() {
                process.current_dir(dir);
            }

            let output = process.output().await.map_err(|err| ExecError::Spawn {
                program: command.program().to_owned(),
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Runs a command string through `sh -c` on the local machine.
#[must_use]
pub fn local_shell(command: &str) -> CommandLine {
    CommandLine::new("sh").arg("-c").arg(command)
}

/// Executes commands on, and copies files to, a remote target.
pub trait RemoteExecutor: Send + Sync {
    /// Executes `command` on `target` and returns its captured output.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Connection`] when the target is unreachable and
    /// [`ExecError::Spawn`] when the transport cannot be started.
    fn execute<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a str,
    ) -> ExecFuture<'a, CommandOutput>;

    /// Recursively copies the local `source` to `destination` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the transport fails or the copy exits with
    /// a non-zero status.
    fn copy<'a>(
        &'a self,
        target: &'a RemoteTarget,
        source: &'a str,
        destination: &'a str,
    ) -> ExecFuture<'a, ()>;
}

impl<X: RemoteExecutor + ?Sized> RemoteExecutor for Arc<X> {
    fn execute<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a str,
    ) -> ExecFuture<'a, CommandOutput> {
        (**self).execute(target, command)
    }

    fn copy<'a>(
        &'a self,
        target: &'a RemoteTarget,
        source: &'a str,
        destination: &'a str,
    ) -> ExecFuture<'a, ()> {
        (**self).copy(target, source, destination)
    }
}

#[cfg(test)]
mod tests;
