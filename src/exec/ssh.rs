//! [`RemoteExecutor`] backed by the system `ssh` and `scp` clients.

use std::ffi::OsString;

use shell_escape::unix::escape;
use tracing::debug;

use super::{
    CommandLine, CommandOutput, CommandRunner, ExecError, ExecFuture, RemoteExecutor, RemoteTarget,
};

/// OpenSSH reserves exit status 255 for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Client-side settings shared by every SSH and SCP invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Path to the `sshpass` helper used for password logins.
    pub sshpass_bin: String,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; `/dev/null` suits throwaway hosts.
    pub known_hosts_file: String,
    /// Seconds the client waits for the TCP connection.
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sshpass_bin: String::from("sshpass"),
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
        }
    }
}

impl SshSettings {
    /// Options shared by `ssh`, `scp`, and the tunnel launcher.
    ///
    /// `port_flag` differs between `ssh` (`-p`) and `scp` (`-P`).
    #[must_use]
    pub fn common_options(&self, target: &RemoteTarget, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(target.port.to_string()),
        ];

        if let Some(ref identity_file) = target.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file));
        }

        if target.password.is_none() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.connect_timeout_secs
        )));
        args
    }

    /// Wraps `program` in `sshpass -e` when the target logs in by password.
    #[must_use]
    pub fn command_for(&self, program: &str, target: &RemoteTarget) -> CommandLine {
        match target.password {
            Some(ref password) => CommandLine::new(self.sshpass_bin.clone())
                .arg("-e")
                .arg(program)
                .env("SSHPASS", password.clone()),
            None => CommandLine::new(program),
        }
    }
}

/// Runs remote commands through OpenSSH.
#[derive(Clone, Debug)]
pub struct SshExecutor<R: CommandRunner> {
    settings: SshSettings,
    runner: R,
}

impl<R: CommandRunner> SshExecutor<R> {
    /// Creates an executor using the provided runner.
    #[must_use]
    pub const fn new(settings: SshSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    /// Returns the client settings.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    fn ssh_command(&self, target: &RemoteTarget, command: &str) -> CommandLine {
        self.settings
            .command_for(&self.settings.ssh_bin, target)
            .args(self.settings.common_options(target, "-p"))
            .arg(target.destination())
            .arg(command)
    }

    fn scp_command(&self, target: &RemoteTarget, source: &str, destination: &str) -> CommandLine {
        let remote_path = escape(destination.into());
        self.settings
            .command_for(&self.settings.scp_bin, target)
            .arg("-r")
            .args(self.settings.common_options(target, "-P"))
            .arg(source)
            .arg(format!("{}:{remote_path}", target.destination()))
    }
}

impl<R: CommandRunner> RemoteExecutor for SshExecutor<R> {
    fn execute<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a str,
    ) -> ExecFuture<'a, CommandOutput> {
        Box::pin(async move {
            debug!(%target, command, "executing remote command");
            let output = self.runner.run(&self.ssh_command(target, command)).await?;
            if output.code == Some(SSH_TRANSPORT_FAILURE) {
                return Err(ExecError::Connection {
                    target: target.to_string(),
                    message: output.stderr.trim().to_owned(),
                });
            }
            Ok(output)
        })
    }

    fn copy<'a>(
        &'a self,
        target: &'a RemoteTarget,
        source: &'a str,
        destination: &'a str,
    ) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            debug!(%target, source, destination, "copying to remote host");
            let command = self.scp_command(target, source, destination);
            let output = self.runner.run(&command).await?;
            output.into_success(&self.settings.scp_bin).map(|_| ())
        })
    }
}
