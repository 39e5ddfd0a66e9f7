//! Backend drivers for every supported virtualization kind.
//!
//! [`DriverFactory`] turns a [`HostSpec`] into the matching driver. Drivers
//! that shell out to vendor tooling share one [`CommandRunner`] so tests can
//! script their invocations; the container and vSphere drivers talk to their
//! engines over HTTP through small API traits with fakes of their own.

use std::sync::Arc;

use crate::backend::{Backend, BackendError, BackendFactory, BackendKind};
use crate::config::OvercastConfig;
use crate::exec::{CommandLine, CommandOutput, CommandRunner, ExecError};
use crate::host_spec::{BackendSpec, HostSpec};

pub mod cloud;
pub mod docker;
mod existing;
pub mod libvirt;
pub mod vagrant;
pub mod virtualbox;
pub mod vmware;

pub use cloud::CloudDriver;
pub use docker::{BollardEngine, ContainerApi, DockerDriver};
pub use existing::ExistingDriver;
pub use libvirt::LibvirtDriver;
pub use vagrant::VagrantDriver;
pub use virtualbox::{VboxManage, VirtualboxDriver};
pub use vmware::{RestVsphereClient, VmwareDriver, VsphereApi};

/// Builds production drivers from host specifications.
#[derive(Clone)]
pub struct DriverFactory {
    config: OvercastConfig,
    runner: Arc<dyn CommandRunner>,
}

impl DriverFactory {
    /// Creates a factory whose command-line drivers run through `runner`.
    #[must_use]
    pub const fn new(config: OvercastConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }
}

impl std::fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackendFactory for DriverFactory {
    fn build(&self, spec: &HostSpec) -> Result<Arc<dyn Backend>, BackendError> {
        let runner = Arc::clone(&self.runner);
        let driver: Arc<dyn Backend> = match &spec.backend {
            BackendSpec::Existing { hostname } => Arc::new(ExistingDriver::new(hostname)),
            BackendSpec::Cloud(cloud) => Arc::new(CloudDriver::new(
                &spec.label,
                cloud.clone(),
                &self.config.aws_bin,
                runner,
            )),
            BackendSpec::Vagrant(vagrant) => Arc::new(VagrantDriver::new(
                vagrant.clone(),
                &self.config.vagrant_bin,
                VboxManage::new(&self.config.vboxmanage_bin, Arc::clone(&runner)),
                runner,
            )),
            BackendSpec::Virtualbox(virtualbox) => Arc::new(VirtualboxDriver::new(
                virtualbox.clone(),
                VboxManage::new(&self.config.vboxmanage_bin, runner),
            )),
            BackendSpec::Libvirt(libvirt) => Arc::new(LibvirtDriver::new(
                libvirt.clone(),
                libvirt::LibvirtTools::from_config(&self.config),
                runner,
            )),
            BackendSpec::Docker(docker) => {
                let engine = BollardEngine::new(docker)?;
                Arc::new(DockerDriver::new(docker.clone(), Arc::new(engine)))
            }
            BackendSpec::Vmware(vmware) => {
                let client = RestVsphereClient::new(vmware)?;
                Arc::new(VmwareDriver::new(vmware.clone(), Arc::new(client)))
            }
        };
        Ok(driver)
    }
}

/// Runs a vendor tool and converts a non-zero exit into an error.
async fn run_tool(
    runner: &dyn CommandRunner,
    command: &CommandLine,
) -> Result<CommandOutput, ExecError> {
    runner
        .run(command)
        .await?
        .into_success(command.program())
}

/// Maps a tool failure onto a creation error for `kind`.
fn creation_error(kind: BackendKind) -> impl Fn(ExecError) -> BackendError {
    move |err| BackendError::creation(kind, err)
}

#[cfg(test)]
mod tests;
