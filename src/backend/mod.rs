//! Backend abstraction for provisioning disposable hosts.
//!
//! Each virtualization kind implements [`Backend`]; the lifecycle
//! orchestrator drives every kind through the same three calls and never
//! inspects which one it is talking to.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::host_spec::HostSpec;

/// Virtualization kinds supported by the orchestrator.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum BackendKind {
    /// A host that already exists and is never created or destroyed.
    Existing,
    /// An instance launched through a cloud provider API.
    CloudInstance,
    /// A desktop VM managed by Vagrant.
    DesktopVm,
    /// A copy-on-write clone of a libvirt domain.
    Hypervisor,
    /// A container started through the Docker engine API.
    Container,
    /// A clone made through the vSphere REST API.
    EnterpriseHypervisor,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Existing => "existing",
            Self::CloudInstance => "cloud-instance",
            Self::DesktopVm => "desktop-vm",
            Self::Hypervisor => "hypervisor",
            Self::Container => "container",
            Self::EnterpriseHypervisor => "enterprise-hypervisor",
        };
        f.write_str(name)
    }
}

/// Handle returned by a backend once an instance exists.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Driver-private facts needed again at teardown (for example the
    /// state a Vagrant box was in before it was brought up).
    pub metadata: BTreeMap<String, String>,
}

impl InstanceHandle {
    /// Creates a handle without metadata.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attaches one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Reachable network location of a host.
///
/// `ports` maps a port on the guest to the port a client must dial instead,
/// for backends that publish or forward ports. Unlisted ports are reached
/// directly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostAddress {
    /// Host name or IP address to connect to.
    pub host: String,
    /// Guest port to published port translations.
    pub ports: BTreeMap<u16, u16>,
}

impl HostAddress {
    /// Creates an address without port translations.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ports: BTreeMap::new(),
        }
    }

    /// Adds a port translation.
    #[must_use]
    pub fn with_port(mut self, guest: u16, published: u16) -> Self {
        self.ports.insert(guest, published);
        self
    }

    /// Port a client should dial to reach `guest` on this host.
    #[must_use]
    pub fn port(&self, guest: u16) -> u16 {
        self.ports.get(&guest).copied().unwrap_or(guest)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// How a backend reports where its instance can be reached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddressSource {
    /// The backend knows the address itself.
    Resolved(HostAddress),
    /// The address must be looked up with the host's IP resolution
    /// strategy, keyed by the given identifier (usually a MAC address).
    Lookup {
        /// Identifier substituted into the lookup command.
        key: String,
    },
}

/// Uniform errors reported by every backend driver.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend rejected or failed the create, clone, or start request.
    #[error("{kind} backend failed to create instance: {message}")]
    Creation {
        /// Backend reporting the failure.
        kind: BackendKind,
        /// Provider specific description.
        message: String,
    },
    /// The backend could not report the instance address.
    #[error("{kind} backend could not report an address for {id}: {message}")]
    Address {
        /// Backend reporting the failure.
        kind: BackendKind,
        /// Instance identifier.
        id: String,
        /// Provider specific description.
        message: String,
    },
    /// The instance no longer exists.
    #[error("{kind} instance {id} is already gone")]
    Gone {
        /// Backend reporting the condition.
        kind: BackendKind,
        /// Instance identifier.
        id: String,
    },
    /// Tearing down a live instance failed.
    #[error("{kind} backend failed to destroy {id}: {message}")]
    Destroy {
        /// Backend reporting the failure.
        kind: BackendKind,
        /// Instance identifier.
        id: String,
        /// Provider specific description.
        message: String,
    },
    /// The host specification cannot drive this backend.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BackendError {
    /// Shorthand for [`BackendError::Creation`].
    #[must_use]
    pub fn creation(kind: BackendKind, message: impl fmt::Display) -> Self {
        Self::Creation {
            kind,
            message: message.to_string(),
        }
    }

    /// Shorthand for [`BackendError::Destroy`].
    #[must_use]
    pub fn destroy(kind: BackendKind, id: &str, message: impl fmt::Display) -> Self {
        Self::Destroy {
            kind,
            id: id.to_owned(),
            message: message.to_string(),
        }
    }

    /// Shorthand for [`BackendError::Address`].
    #[must_use]
    pub fn address(kind: BackendKind, id: &str, message: impl fmt::Display) -> Self {
        Self::Address {
            kind,
            id: id.to_owned(),
            message: message.to_string(),
        }
    }

    /// Returns `true` when the error only says the instance is already gone.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// How provisioning done on one run carries over to the next.
#[derive(Clone, Copy)]
pub enum ProvisionReuse<'a> {
    /// Every instance starts from the unprovisioned base, so provisioning
    /// always runs.
    Never,
    /// Every run gets the same machine back, so a tag recorded after its
    /// last successful provisioning still describes it.
    SameMachine,
    /// Provisioned instances can be kept as images and cloned.
    Images(&'a dyn ImageCache),
}

impl fmt::Debug for ProvisionReuse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Never => "Never",
            Self::SameMachine => "SameMachine",
            Self::Images(_) => "Images",
        };
        f.write_str(name)
    }
}

/// Keeps provisioned instances as images that later instances are cloned
/// from.
///
/// Images are stamped with the cache key of the host specification that
/// built them and the expiration tag of the provisioning run. An instance
/// created from an image is provisioned exactly as far as that tag says.
pub trait ImageCache: Send + Sync {
    /// Finds an image stamped with `cache_key` and `tag`.
    ///
    /// Images stamped with `cache_key` and another tag are stale; they are
    /// deleted unless an instance still runs on top of them.
    fn find<'a>(&'a self, cache_key: &'a str, tag: &'a str) -> BackendFuture<'a, Option<String>>;

    /// Shuts the provisioned `instance` down and keeps it as an image
    /// stamped with `cache_key` and `tag`, returning the image name.
    ///
    /// The instance stops being a disposable host: teardown must not
    /// destroy it afterwards.
    fn capture<'a>(
        &'a self,
        instance: &'a InstanceHandle,
        cache_key: &'a str,
        tag: &'a str,
    ) -> BackendFuture<'a, String>;

    /// Creates and starts an instance backed by `image`.
    ///
    /// Like [`Backend::create`], a failure leaves nothing behind.
    fn create_from<'a>(&'a self, image: &'a str) -> BackendFuture<'a, InstanceHandle>;
}

/// Capability interface implemented by every backend driver.
///
/// A driver is built for one host specification and owns the parameters it
/// needs; calls only carry the instance handle.
pub trait Backend: Send + Sync {
    /// Virtualization kind of this driver.
    fn kind(&self) -> BackendKind;

    /// Creates (or clones) and starts an instance.
    ///
    /// Drivers clean up any partially created resources before returning an
    /// error, so a failed create leaves nothing for teardown to remove.
    fn create(&self) -> BackendFuture<'_, InstanceHandle>;

    /// Reports where the instance can be reached.
    fn address<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource>;

    /// Destroys the instance.
    ///
    /// Returns [`BackendError::Gone`] when there is nothing left to destroy.
    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()>;

    /// How provisioning carries over between runs.
    fn provision_reuse(&self) -> ProvisionReuse<'_> {
        ProvisionReuse::Never
    }
}

/// Builds the driver for a host specification.
pub trait BackendFactory: Send + Sync {
    /// Returns the driver for `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when the driver cannot be built from
    /// the specification (for example an engine endpoint with an unsupported scheme).
    fn build(&self, spec: &HostSpec) -> Result<Arc<dyn Backend>, BackendError>;
}
