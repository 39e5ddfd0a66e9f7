//! Backend-specific host parameters.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::backend::BackendKind;
use crate::config::{ConfigError, PropertyScope};

use super::FilesystemMapping;

/// Default Docker engine endpoint.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
/// Default container image.
pub const DEFAULT_DOCKER_IMAGE: &str = "busybox";
/// Default libvirt connection URL.
pub const DEFAULT_LIBVIRT_URL: &str = "qemu:///system";
/// Default EC2 endpoint.
pub const DEFAULT_EC2_ENDPOINT: &str = "https://ec2.amazonaws.com";

/// Selected backend and its parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendSpec {
    /// A host that already exists.
    Existing {
        /// Host name or address.
        hostname: String,
    },
    /// A cloud instance.
    Cloud(CloudSpec),
    /// A Vagrant-managed desktop VM.
    Vagrant(VagrantSpec),
    /// A VirtualBox VM reset to a snapshot.
    Virtualbox(VirtualboxSpec),
    /// A libvirt domain clone.
    Libvirt(LibvirtSpec),
    /// A Docker container.
    Docker(DockerSpec),
    /// A vSphere clone.
    Vmware(VmwareSpec),
}

impl BackendSpec {
    pub(crate) fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        if let Some(hostname) = scope.get("hostname") {
            return Ok(Self::Existing {
                hostname: hostname.to_owned(),
            });
        }
        if scope.contains("vagrantDir") {
            return VagrantSpec::from_scope(scope).map(Self::Vagrant);
        }
        if scope.contains("amiId") {
            return CloudSpec::from_scope(scope).map(Self::Cloud);
        }
        if scope.contains("vboxUuid") {
            return VirtualboxSpec::from_scope(scope).map(Self::Virtualbox);
        }
        if scope.contains("baseDomain") {
            return LibvirtSpec::from_scope(scope).map(Self::Libvirt);
        }
        if scope.contains("dockerHost") || scope.contains("dockerImage") {
            return DockerSpec::from_scope(scope).map(Self::Docker);
        }
        if scope.contains("vmBaseImage") {
            return VmwareSpec::from_scope(scope).map(Self::Vmware);
        }
        Err(ConfigError::NoBackend {
            label: scope.label().to_owned(),
        })
    }

    /// Virtualization kind of this backend.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Existing { .. } => BackendKind::Existing,
            Self::Cloud(_) => BackendKind::CloudInstance,
            Self::Vagrant(_) | Self::Virtualbox(_) => BackendKind::DesktopVm,
            Self::Libvirt(_) => BackendKind::Hypervisor,
            Self::Docker(_) => BackendKind::Container,
            Self::Vmware(_) => BackendKind::EnterpriseHypervisor,
        }
    }

    /// Identifies the image or base the instance is made from.
    #[must_use]
    pub fn base_identity(&self) -> String {
        match self {
            Self::Existing { hostname } => hostname.clone(),
            Self::Cloud(cloud) => cloud.ami_id.clone(),
            Self::Vagrant(vagrant) => format!("{}#{}", vagrant.dir, vagrant.vm),
            Self::Virtualbox(virtualbox) => {
                format!("{}@{}", virtualbox.uuid, virtualbox.snapshot)
            }
            Self::Libvirt(libvirt) => libvirt.base_domain.clone(),
            Self::Docker(docker) => docker.image.clone(),
            Self::Vmware(vmware) => vmware.base_image.clone(),
        }
    }
}

/// Parameters of a cloud instance.
#[derive(Clone, PartialEq, Eq)]
pub struct CloudSpec {
    /// Machine image to launch.
    pub ami_id: String,
    /// Instance type, for example `t3.micro`.
    pub instance_type: String,
    /// Security group name.
    pub security_group: String,
    /// Key pair name.
    pub key_name: String,
    /// Optional placement zone.
    pub availability_zone: Option<String>,
    /// Time allowed for the instance to reach `running`.
    pub boot_timeout: Duration,
    /// API endpoint.
    pub endpoint: String,
    /// Optional region override.
    pub region: Option<String>,
    /// Access key id; the CLI's own credential chain is used when absent.
    pub access_key: Option<String>,
    /// Secret access key.
    pub secret_key: Option<String>,
}

impl CloudSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            ami_id: scope.require("amiId")?.to_owned(),
            instance_type: scope.require("amiInstanceType")?.to_owned(),
            security_group: scope.require("amiSecurityGroup")?.to_owned(),
            key_name: scope.require("amiKeyName")?.to_owned(),
            availability_zone: scope.get("amiAvailabilityZone").map(ToOwned::to_owned),
            boot_timeout: scope.get_secs("amiBootSeconds", 120)?,
            endpoint: scope.get_or("aws.endpoint", DEFAULT_EC2_ENDPOINT),
            region: scope.get("aws.region").map(ToOwned::to_owned),
            access_key: scope.get("aws.accessKey").map(ToOwned::to_owned),
            secret_key: scope.get("aws.secretKey").map(ToOwned::to_owned),
        })
    }
}

impl fmt::Debug for CloudSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSpec")
            .field("ami_id", &self.ami_id)
            .field("instance_type", &self.instance_type)
            .field("security_group", &self.security_group)
            .field("key_name", &self.key_name)
            .field("availability_zone", &self.availability_zone)
            .field("boot_timeout", &self.boot_timeout)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "********"))
            .finish()
    }
}

/// Parameters of a Vagrant box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VagrantSpec {
    /// Directory holding the `Vagrantfile`.
    pub dir: Utf8PathBuf,
    /// Machine name inside the `Vagrantfile`.
    pub vm: String,
    /// Statically configured address of the box.
    pub ip: String,
    /// Extra arguments for `vagrant up`.
    pub parameters: Vec<String>,
    /// Guest operating system family.
    pub os: String,
    /// Command run in `dir` whose output tags the box's snapshot. When set,
    /// the box is kept between runs and restored from its snapshot while
    /// the tag still matches.
    pub snapshot_expiration_cmd: Option<String>,
}

impl VagrantSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            dir: Utf8PathBuf::from(scope.require("vagrantDir")?),
            vm: scope.get_or("vagrantVm", "default"),
            ip: scope.require("vagrantIp")?.to_owned(),
            parameters: scope.get_words("vagrantParameters"),
            os: scope.get_or("vagrantOs", "UNIX"),
            snapshot_expiration_cmd: scope
                .get("vagrantSnapshotExpirationCmd")
                .map(ToOwned::to_owned),
        })
    }
}

/// Parameters of a VirtualBox VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualboxSpec {
    /// VM name or UUID.
    pub uuid: String,
    /// Statically configured address of the VM.
    pub ip: String,
    /// Snapshot restored before every use.
    pub snapshot: String,
}

impl VirtualboxSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            uuid: scope.require("vboxUuid")?.to_owned(),
            ip: scope.require("vboxBoxIp")?.to_owned(),
            snapshot: scope.require("vboxSnapshotUuid")?.to_owned(),
        })
    }
}

/// Parameters of a libvirt clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibvirtSpec {
    /// Connection URL.
    pub url: String,
    /// Domain to clone.
    pub base_domain: String,
    /// Network whose interface MAC is used for the address lookup; the first
    /// interface is used when absent.
    pub network: Option<String>,
    /// Time allowed for the base to shut down and for the clone to start.
    pub start_timeout: Duration,
    /// Pause between starting the clone and the first address lookup.
    pub boot_delay: Duration,
    /// Directories shared into the clone.
    pub fs_mappings: Vec<FilesystemMapping>,
}

impl LibvirtSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: scope.get_or("libvirtURL", DEFAULT_LIBVIRT_URL),
            base_domain: scope.require("baseDomain")?.to_owned(),
            network: scope.get("network").map(ToOwned::to_owned),
            start_timeout: scope.get_secs("libvirtStartTimeout", 30)?,
            boot_delay: scope.get_secs("libvirtBootDelay", 0)?,
            fs_mappings: FilesystemMapping::all_from_scope(scope)?,
        })
    }
}

/// Parameters of a container.
#[derive(Clone, Debug, PartialEq, Eq)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "mirrors independent user-facing container toggles"
)]
pub struct DockerSpec {
    /// Engine endpoint (`unix://`, `tcp://`, `http://`, or `https://`).
    pub host: String,
    /// Directory with `key.pem`, `cert.pem`, and `ca.pem` for TLS endpoints.
    pub certificates: Option<Utf8PathBuf>,
    /// Image to run.
    pub image: String,
    /// Container name; a collision fails creation.
    pub name: Option<String>,
    /// Command override.
    pub command: Vec<String>,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Remove the container at teardown.
    pub remove: bool,
    /// Remove anonymous volumes with the container.
    pub remove_volume: bool,
    /// Ports to expose, such as `8080/tcp`.
    pub exposed_ports: Vec<String>,
    /// Publish every exposed port on a random host port.
    pub expose_all_ports: bool,
}

impl DockerSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: scope.get_or("dockerHost", DEFAULT_DOCKER_HOST),
            certificates: scope.get("certificates").map(Utf8PathBuf::from),
            image: scope.get_or("dockerImage", DEFAULT_DOCKER_IMAGE),
            name: scope.get("name").map(ToOwned::to_owned),
            command: scope.get_words("command"),
            env: scope.get_list("env"),
            remove: scope.get_bool("remove", false)?,
            remove_volume: scope.get_bool("removeVolume", false)?,
            exposed_ports: scope.get_list("exposedPorts"),
            expose_all_ports: scope.get_bool("exposeAllPorts", false)?,
        })
    }
}

/// Minimum TLS version accepted from the vSphere endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Library default.
    #[default]
    Default,
    /// TLS 1.2 or newer.
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

impl TlsPolicy {
    fn parse(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        let raw = scope.get_or("securityAlgorithm", "TLS");
        match raw.to_ascii_uppercase().as_str() {
            "TLS" => Ok(Self::Default),
            "TLSV1.2" => Ok(Self::Tls12),
            "TLSV1.3" => Ok(Self::Tls13),
            _ => Err(scope.invalid("securityAlgorithm", &raw, "expected TLS, TLSv1.2, or TLSv1.3")),
        }
    }
}

/// Parameters of a vSphere clone.
#[derive(Clone, PartialEq, Eq)]
pub struct VmwareSpec {
    /// vCenter host name, optionally with a port.
    pub api_host: String,
    /// Base64 `user:password` for the session endpoint.
    pub auth_hash: String,
    /// VM to clone.
    pub base_image: String,
    /// Instant clone from a running source when `true`; full clone
    /// otherwise.
    pub instance_clone: bool,
    /// Retries after the first attempt for transient REST failures.
    pub max_retries: usize,
    /// Time allowed for each REST call.
    pub start_timeout: Duration,
    /// Accept invalid certificates from the endpoint.
    pub ignore_bad_certificate: bool,
    /// Minimum TLS version.
    pub security_algorithm: TlsPolicy,
}

impl VmwareSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        let max_retries = scope.get_u64("maxRetries", 15)?;
        Ok(Self {
            api_host: scope.require("vmwareApiHost")?.to_owned(),
            auth_hash: scope.require("vmwareAuthHash")?.to_owned(),
            base_image: scope.require("vmBaseImage")?.to_owned(),
            instance_clone: scope.get_bool("instanceClone", true)?,
            max_retries: usize::try_from(max_retries).map_err(|_| {
                scope.invalid("maxRetries", &max_retries.to_string(), "value too large")
            })?,
            start_timeout: scope.get_secs("vmwareStartTimeout", 180)?,
            ignore_bad_certificate: scope.get_bool("ignoreBadCertificate", false)?,
            security_algorithm: TlsPolicy::parse(scope)?,
        })
    }
}

impl fmt::Debug for VmwareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmwareSpec")
            .field("api_host", &self.api_host)
            .field("auth_hash", &"********")
            .field("base_image", &self.base_image)
            .field("instance_clone", &self.instance_clone)
            .field("max_retries", &self.max_retries)
            .field("start_timeout", &self.start_timeout)
            .field("ignore_bad_certificate", &self.ignore_bad_certificate)
            .field("security_algorithm", &self.security_algorithm)
            .finish()
    }
}
