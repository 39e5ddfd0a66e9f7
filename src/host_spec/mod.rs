//! Immutable host descriptors resolved from host properties.
//!
//! [`HostSpec::from_properties`] is the only place that interprets the
//! `{label}.key` hierarchy; everything downstream works with typed values.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::backend::BackendKind;
use crate::config::{ConfigError, HostProperties, PropertyScope};
use crate::tunnel::{TunnelSpec, parse_port_forwards};

mod backends;

pub use backends::{
    BackendSpec, CloudSpec, DEFAULT_DOCKER_HOST, DockerSpec, LibvirtSpec, TlsPolicy, VagrantSpec,
    VirtualboxSpec, VmwareSpec,
};

const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 60;

/// Everything needed to acquire and release one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSpec {
    /// Label the host is registered under.
    pub label: String,
    /// Backend selection and its parameters.
    pub backend: BackendSpec,
    /// Strategy used when the backend asks for an address lookup.
    pub ip_lookup: Option<IpLookupStrategy>,
    /// Port forwarding applied once the address is known.
    pub tunnel: Option<TunnelSpec>,
    /// Provisioning applied once the host is reachable.
    pub provision: Option<ProvisionSpec>,
}

impl HostSpec {
    /// Resolves the descriptor for `label`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when no backend is selected, a required key is
    /// missing, or a value is outside its accepted domain.
    pub fn from_properties(label: &str, properties: &HostProperties) -> Result<Self, ConfigError> {
        let scope = properties.scope(label);
        let backend = BackendSpec::from_scope(&scope)?;
        let ip_lookup = if backend.kind() == BackendKind::Hypervisor {
            Some(IpLookupStrategy::from_scope(&scope)?)
        } else {
            None
        };

        Ok(Self {
            label: label.to_owned(),
            backend,
            ip_lookup,
            tunnel: tunnel_from_scope(&scope)?,
            provision: ProvisionSpec::from_scope(&scope)?,
        })
    }

    /// Virtualization kind selected for this host.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Key under which the provisioning expiration tag of this host's base
    /// image is recorded.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let command = self
            .provision
            .as_ref()
            .map_or("", |provision| provision.command.as_str());
        format!("{}|{}|{command}", self.kind(), self.backend.base_identity())
    }
}

/// How the address of a hypervisor clone is discovered.
#[derive(Clone, PartialEq, Eq)]
pub enum IpLookupStrategy {
    /// A fixed, pre-configured address.
    Static {
        /// The address.
        ip: String,
    },
    /// Poll a DHCP authority over SSH until it reports a lease.
    LeaseLookup {
        /// Connection URL of the DHCP authority.
        url: String,
        /// Lookup command; `{0}` is replaced with the MAC address.
        command: String,
        /// Time allowed for the lease to appear.
        timeout: Duration,
    },
}

impl IpLookupStrategy {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Self, ConfigError> {
        let selected = scope.get_or("ipLookupStrategy", "SSH");
        match selected.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static {
                ip: scope.require("static.ip")?.to_owned(),
            }),
            "ssh" => Ok(Self::LeaseLookup {
                url: scope.require("SSH.url")?.to_owned(),
                command: scope.require("SSH.command")?.to_owned(),
                timeout: scope.get_secs("SSH.timeout", DEFAULT_LOOKUP_TIMEOUT_SECS)?,
            }),
            _ => Err(scope.invalid("ipLookupStrategy", &selected, "expected SSH or static")),
        }
    }
}

impl fmt::Debug for IpLookupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static { ip } => f.debug_struct("Static").field("ip", ip).finish(),
            Self::LeaseLookup {
                command, timeout, ..
            } => f
                .debug_struct("LeaseLookup")
                .field("url", &"<redacted>")
                .field("command", command)
                .field("timeout", timeout)
                .finish(),
        }
    }
}

/// Expiration tag configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpirationTag {
    /// Command whose trimmed output is the tag.
    pub command: String,
    /// Where to run the command; locally when absent.
    pub url: Option<String>,
}

/// What to copy and run once a host is reachable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionSpec {
    /// Connection URL; `{0}` is replaced with the host address.
    pub url: String,
    /// Provisioning command run on the host.
    pub command: String,
    /// Copy list, paired by [`crate::provision::copy_plan`].
    pub copy: Vec<String>,
    /// Time allowed for copy and command to succeed.
    pub start_timeout: Duration,
    /// Pause before the first attempt.
    pub boot_delay: Duration,
    /// Cache policy; every run provisions when absent.
    pub expiration_tag: Option<ExpirationTag>,
}

impl ProvisionSpec {
    fn from_scope(scope: &PropertyScope<'_>) -> Result<Option<Self>, ConfigError> {
        let Some(command) = scope.get("provision.cmd") else {
            return Ok(None);
        };
        let expiration_tag = scope
            .get("provision.expirationTag.cmd")
            .map(|tag_command| ExpirationTag {
                command: tag_command.to_owned(),
                url: scope
                    .get("provision.expirationTag.url")
                    .map(ToOwned::to_owned),
            });

        Ok(Some(Self {
            url: scope.require("provision.url")?.to_owned(),
            command: command.to_owned(),
            copy: scope.get_list("provision.copy"),
            start_timeout: scope
                .get_secs("provision.startTimeout", DEFAULT_PROVISION_TIMEOUT_SECS)?,
            boot_delay: scope.get_secs("provision.bootDelay", 0)?,
            expiration_tag,
        }))
    }
}

/// How a guest sees a shared host directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Guest accesses files with the credentials of the host user.
    Passthrough,
    /// Guest credentials are stored in extended attributes.
    Mapped,
    /// Like passthrough, but failed privileged operations are ignored.
    Squash,
}

impl AccessMode {
    /// Name understood by libvirt.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Mapped => "mapped",
            Self::Squash => "squash",
        }
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "passthrough" => Ok(Self::Passthrough),
            "mapped" => Ok(Self::Mapped),
            "squash" => Ok(Self::Squash),
            _ => Err(String::from("expected passthrough, mapped, or squash")),
        }
    }
}

/// A host directory shared into a hypervisor clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesystemMapping {
    /// Mount tag seen by the guest.
    pub target: String,
    /// Directory on the hypervisor host.
    pub host_path: Utf8PathBuf,
    /// Credential mapping mode.
    pub access_mode: AccessMode,
    /// Whether the guest may write.
    pub read_only: bool,
}

impl FilesystemMapping {
    pub(crate) fn all_from_scope(scope: &PropertyScope<'_>) -> Result<Vec<Self>, ConfigError> {
        scope
            .children("fsMapping")
            .into_iter()
            .map(|target| -> Result<Self, ConfigError> {
                let prefix = format!("fsMapping.{target}");
                let mode_key = format!("{prefix}.accessMode");
                let raw_mode = scope.get_or(&mode_key, "passthrough");
                let access_mode = raw_mode
                    .parse()
                    .map_err(|reason: String| scope.invalid(&mode_key, &raw_mode, &reason))?;
                Ok(Self {
                    host_path: Utf8PathBuf::from(scope.require(&format!("{prefix}.hostPath"))?),
                    access_mode,
                    read_only: scope.get_bool(&format!("{prefix}.readOnly"), false)?,
                    target,
                })
            })
            .collect()
    }
}

fn tunnel_from_scope(scope: &PropertyScope<'_>) -> Result<Option<TunnelSpec>, ConfigError> {
    let Some(username) = scope.get("tunnel.username") else {
        return Ok(None);
    };
    let raw_ports = scope.require("tunnel.ports")?;
    let ports = parse_port_forwards(raw_ports)
        .map_err(|err| scope.invalid("tunnel.ports", raw_ports, &err.to_string()))?;

    Ok(Some(TunnelSpec {
        username: username.to_owned(),
        password: Some(scope.require("tunnel.password")?.to_owned()),
        ports,
        setup_timeout: scope.get_secs("tunnel.setupTimeout", 0)?,
    }))
}
