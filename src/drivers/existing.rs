//! Driver for hosts that already exist.

use tracing::debug;

use crate::backend::{
    AddressSource, Backend, BackendFuture, BackendKind, HostAddress, InstanceHandle,
    ProvisionReuse,
};

/// Reports a fixed host name and never creates or destroys anything.
#[derive(Clone, Debug)]
pub struct ExistingDriver {
    hostname: String,
}

impl ExistingDriver {
    /// Creates a driver for `hostname`.
    #[must_use]
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
        }
    }
}

impl Backend for ExistingDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Existing
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(async move {
            debug!(hostname = %self.hostname, "using existing host");
            Ok(InstanceHandle::new(self.hostname.clone()))
        })
    }

    fn address<'a>(&'a self, _handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move { Ok(AddressSource::Resolved(HostAddress::new(&self.hostname))) })
    }

    fn destroy<'a>(&'a self, _handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn provision_reuse(&self) -> ProvisionReuse<'_> {
        ProvisionReuse::SameMachine
    }
}
