//! Cloud instances driven through the AWS command-line client.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{info, warn};

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFuture, BackendKind, HostAddress,
    InstanceHandle,
};
use crate::exec::{CommandLine, CommandOutput, CommandRunner, ExecError};
use crate::host_spec::CloudSpec;
use crate::wait::{PollPolicy, poll_until};

use super::{creation_error, run_tool};

const KIND: BackendKind = BackendKind::CloudInstance;
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ADDRESS_KEY: &str = "address";
const NOT_FOUND_CODE: &str = "InvalidInstanceID.NotFound";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    instances: Vec<LaunchedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchedInstance {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<DescribedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribedInstance {
    state: InstanceState,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    public_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

impl DescribedInstance {
    fn public_address(&self) -> Option<&str> {
        self.public_dns_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                self.public_ip_address
                    .as_deref()
                    .filter(|ip| !ip.is_empty())
            })
    }
}

/// Launches one instance per host and terminates it at teardown.
pub struct CloudDriver {
    label: String,
    spec: CloudSpec,
    aws_bin: String,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

impl CloudDriver {
    /// Creates a driver for the host labelled `label`.
    #[must_use]
    pub fn new(
        label: &str,
        spec: CloudSpec,
        aws_bin: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            label: label.to_owned(),
            spec,
            aws_bin: aws_bin.to_owned(),
            runner,
            poll_interval: STATE_POLL_INTERVAL,
        }
    }

    /// Overrides the pause between state polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn ec2(&self, operation: &str) -> CommandLine {
        let mut command = CommandLine::new(&self.aws_bin)
            .args(["--output", "json", "--endpoint-url"])
            .arg(&self.spec.endpoint);
        if let Some(region) = &self.spec.region {
            command = command.arg("--region").arg(region);
        }
        if let Some(access_key) = &self.spec.access_key {
            command = command.env("AWS_ACCESS_KEY_ID", access_key);
        }
        if let Some(secret_key) = &self.spec.secret_key {
            command = command.env("AWS_SECRET_ACCESS_KEY", secret_key);
        }
        command.arg("ec2").arg(operation)
    }

    async fn launch(&self) -> Result<String, BackendError> {
        let mut command = self
            .ec2("run-instances")
            .arg("--image-id")
            .arg(&self.spec.ami_id)
            .arg("--instance-type")
            .arg(&self.spec.instance_type)
            .arg("--security-groups")
            .arg(&self.spec.security_group)
            .arg("--key-name")
            .arg(&self.spec.key_name)
            .args(["--count", "1"]);
        if let Some(zone) = &self.spec.availability_zone {
            command = command
                .arg("--placement")
                .arg(format!("AvailabilityZone={zone}"));
        }

        let output = run_tool(self.runner.as_ref(), &command)
            .await
            .map_err(creation_error(KIND))?;
        let parsed: RunInstancesOutput = serde_json::from_str(&output.stdout)
            .map_err(|err| BackendError::creation(KIND, format!("unreadable run-instances output: {err}")))?;
        parsed
            .instances
            .into_iter()
            .next()
            .map(|instance| instance.instance_id)
            .ok_or_else(|| BackendError::creation(KIND, "run-instances returned no instance"))
    }

    async fn tag(&self, instance_id: &str) -> Result<(), ExecError> {
        let started = humantime::format_rfc3339_seconds(SystemTime::now());
        let command = self
            .ec2("create-tags")
            .arg("--resources")
            .arg(instance_id)
            .arg("--tags")
            .arg(format!("Key=Name,Value={} started at {started}", self.label));
        run_tool(self.runner.as_ref(), &command).await.map(drop)
    }

    async fn describe(&self, instance_id: &str) -> Result<Option<DescribedInstance>, ExecError> {
        let command = self
            .ec2("describe-instances")
            .arg("--instance-ids")
            .arg(instance_id);
        let output = run_tool(self.runner.as_ref(), &command).await?;
        let parsed: DescribeInstancesOutput =
            serde_json::from_str(&output.stdout).map_err(|err| {
                ExecError::failure(
                    &self.aws_bin,
                    &CommandOutput {
                        stderr: format!("unreadable describe-instances output: {err}"),
                        ..output.clone()
                    },
                )
            })?;
        Ok(parsed
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .next())
    }

    async fn running_address(&self, instance_id: &str) -> Result<Option<String>, ExecError> {
        let Some(instance) = self.describe(instance_id).await? else {
            return Ok(None);
        };
        if instance.state.name != "running" {
            return Ok(None);
        }
        Ok(instance.public_address().map(ToOwned::to_owned))
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), BackendError> {
        let command = self
            .ec2("terminate-instances")
            .arg("--instance-ids")
            .arg(instance_id);
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|err| BackendError::destroy(KIND, instance_id, err))?;
        if output.is_success() {
            return Ok(());
        }
        if output.stderr.contains(NOT_FOUND_CODE) {
            return Err(BackendError::Gone {
                kind: KIND,
                id: instance_id.to_owned(),
            });
        }
        Err(BackendError::destroy(
            KIND,
            instance_id,
            ExecError::failure(&self.aws_bin, &output),
        ))
    }

    async fn await_running(&self, instance_id: &str) -> Result<String, BackendError> {
        let policy = PollPolicy::new(self.spec.boot_timeout, self.poll_interval);
        poll_until("instance boot", policy, |_| self.running_address(instance_id))
            .await
            .map_err(|exhausted| {
                BackendError::creation(
                    KIND,
                    format!(
                        "instance {instance_id} not running with a public address after {}s: {}",
                        self.spec.boot_timeout.as_secs(),
                        exhausted.describe_last()
                    ),
                )
            })
    }
}

impl std::fmt::Debug for CloudDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudDriver")
            .field("label", &self.label)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl Backend for CloudDriver {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(async move {
            let instance_id = self.launch().await?;
            info!(label = %self.label, instance_id, "launched cloud instance");

            if let Err(err) = self.tag(&instance_id).await {
                warn!(instance_id, error = %err, "could not tag instance");
            }

            match self.await_running(&instance_id).await {
                Ok(address) => {
                    info!(instance_id, address, "cloud instance running");
                    Ok(InstanceHandle::new(instance_id).with_metadata(ADDRESS_KEY, address))
                }
                Err(err) => {
                    if let Err(cleanup) = self.terminate(&instance_id).await {
                        warn!(instance_id, error = %cleanup, "could not terminate instance after failed boot");
                    }
                    Err(err)
                }
            }
        })
    }

    fn address<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move {
            handle
                .metadata
                .get(ADDRESS_KEY)
                .map(|address| AddressSource::Resolved(HostAddress::new(address)))
                .ok_or_else(|| BackendError::address(KIND, &handle.id, "no public address recorded"))
        })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.terminate(&handle.id).await?;
            info!(instance_id = %handle.id, "terminated cloud instance");
            Ok(())
        })
    }
}
