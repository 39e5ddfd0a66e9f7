//! vSphere clones created through the vCenter REST API.
//!
//! Every REST step is retried on transient failures (timeouts, refused
//! connections, server errors, a guest without an address yet) up to
//! `maxRetries` times, five seconds apart. Rejections such as a missing base
//! image or an instant clone of a powered-off source fail immediately.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFuture, BackendKind, HostAddress,
    InstanceHandle,
};
use crate::host_spec::VmwareSpec;

mod client;

pub use client::RestVsphereClient;

const KIND: BackendKind = BackendKind::EnterpriseHypervisor;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const CLONE_SUFFIX_LEN: usize = 8;

/// Failures reported by the vCenter API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VsphereError {
    /// The request may succeed if repeated.
    #[error("transient vSphere failure: {message}")]
    Transient {
        /// Description from the transport or server.
        message: String,
    },
    /// The object does not exist.
    #[error("vSphere object not found: {message}")]
    NotFound {
        /// Description from the server.
        message: String,
    },
    /// The request was refused and repeating it will not help.
    #[error("vSphere rejected the request: {message}")]
    Rejected {
        /// Description from the server or the driver.
        message: String,
    },
}

impl VsphereError {
    /// Returns `true` for failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Future returned by [`VsphereApi`] operations.
pub type VsphereFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, VsphereError>> + Send + 'a>>;

/// vCenter operations used by [`VmwareDriver`].
pub trait VsphereApi: Send + Sync {
    /// Opens a session and returns its identifier.
    fn create_session(&self) -> VsphereFuture<'_, String>;

    /// Looks up a VM identifier by name.
    fn find_vm<'a>(&'a self, session: &'a str, name: &'a str) -> VsphereFuture<'a, Option<String>>;

    /// Reports whether a VM is powered on.
    fn is_powered_on<'a>(&'a self, session: &'a str, vm: &'a str) -> VsphereFuture<'a, bool>;

    /// Clones `source` as `name` and returns the new VM identifier.
    fn clone_vm<'a>(
        &'a self,
        session: &'a str,
        source: &'a str,
        name: &'a str,
        instant: bool,
    ) -> VsphereFuture<'a, String>;

    /// Powers a VM on or off.
    fn set_power<'a>(&'a self, session: &'a str, vm: &'a str, on: bool) -> VsphereFuture<'a, ()>;

    /// Reports the guest IP address, or `None` while tools have not
    /// reported one.
    fn guest_ip<'a>(&'a self, session: &'a str, vm: &'a str) -> VsphereFuture<'a, Option<String>>;

    /// Deletes a VM.
    fn delete<'a>(&'a self, session: &'a str, vm: &'a str) -> VsphereFuture<'a, ()>;
}

/// Name for a new clone of `base`.
fn clone_name(base: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(CLONE_SUFFIX_LEN)
        .collect();
    format!("{base}-{suffix}")
}

/// Clones a base VM for each host.
pub struct VmwareDriver {
    spec: VmwareSpec,
    api: Arc<dyn VsphereApi>,
    retry_interval: Duration,
}

impl VmwareDriver {
    /// Creates a driver using `api` to reach vCenter.
    #[must_use]
    pub const fn new(spec: VmwareSpec, api: Arc<dyn VsphereApi>) -> Self {
        Self {
            spec,
            api,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Runs `action`, retrying transient failures.
    async fn retrying<T, F, Fut>(&self, step: &str, mut action: F) -> Result<T, VsphereError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VsphereError>>,
    {
        let strategy = FixedInterval::new(self.retry_interval).take(self.spec.max_retries);
        let mut attempt = 0_usize;
        RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                let current = attempt;
                let pending = action();
                async move {
                    let result = pending.await;
                    if let Some(err) = result.as_ref().err().filter(|err| err.is_transient()) {
                        warn!(step, attempt = current, error = %err, "vSphere step failed");
                    }
                    result
                }
            },
            VsphereError::is_transient,
        )
        .await
    }

    async fn session(&self) -> Result<String, VsphereError> {
        self.retrying("session", || self.api.create_session()).await
    }

    async fn clone_base(&self, session: &str, name: &str) -> Result<String, VsphereError> {
        let base = self.spec.base_image.as_str();
        let source = self
            .retrying("find base", || self.api.find_vm(session, base))
            .await?
            .ok_or_else(|| VsphereError::Rejected {
                message: format!("base image {base} not found"),
            })?;

        let instant = self.spec.instance_clone;
        if instant {
            let powered_on = self
                .retrying("source power", || self.api.is_powered_on(session, &source))
                .await?;
            if !powered_on {
                return Err(VsphereError::Rejected {
                    message: format!("instant clone requires {base} to be powered on"),
                });
            }
        }

        let vm = self
            .retrying("clone", || self.api.clone_vm(session, &source, name, instant))
            .await?;
        if !instant {
            let powered = self
                .retrying("power on", || self.api.set_power(session, &vm, true))
                .await;
            if let Err(err) = powered {
                if let Err(cleanup) = self.api.delete(session, &vm).await {
                    warn!(vm, error = %cleanup, "could not delete clone after failed power on");
                }
                return Err(err);
            }
        }
        Ok(vm)
    }

    async fn wait_for_ip(&self, vm: &str) -> Result<String, VsphereError> {
        let token = self.session().await?;
        let session = token.as_str();
        self.retrying("guest identity", || async move {
            self.api
                .guest_ip(session, vm)
                .await?
                .ok_or_else(|| VsphereError::Transient {
                    message: format!("guest {vm} has no IP address yet"),
                })
        })
        .await
    }
}

impl std::fmt::Debug for VmwareDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmwareDriver")
            .field("base_image", &self.spec.base_image)
            .field("api_host", &self.spec.api_host)
            .finish_non_exhaustive()
    }
}

impl Backend for VmwareDriver {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(async move {
            let name = clone_name(&self.spec.base_image);
            let session = self
                .session()
                .await
                .map_err(|err| BackendError::creation(KIND, err))?;
            let vm = self
                .clone_base(&session, &name)
                .await
                .map_err(|err| BackendError::creation(KIND, err))?;
            info!(vm, name, instant = self.spec.instance_clone, "vSphere clone created");
            Ok(InstanceHandle::new(vm).with_metadata("name", name))
        })
    }

    fn address<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move {
            let ip = self
                .wait_for_ip(&handle.id)
                .await
                .map_err(|err| BackendError::address(KIND, &handle.id, err))?;
            Ok(AddressSource::Resolved(HostAddress::new(ip)))
        })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let vm = handle.id.as_str();
            let destroy_error = |err: VsphereError| match err {
                VsphereError::NotFound { .. } => BackendError::Gone {
                    kind: KIND,
                    id: vm.to_owned(),
                },
                other => BackendError::destroy(KIND, vm, other),
            };

            let token = self.session().await.map_err(destroy_error)?;
            let session = token.as_str();
            let powered_on = self
                .retrying("power state", || self.api.is_powered_on(session, vm))
                .await
                .map_err(destroy_error)?;
            if powered_on {
                self.retrying("power off", || self.api.set_power(session, vm, false))
                    .await
                    .map_err(destroy_error)?;
            }
            self.retrying("delete", || self.api.delete(session, vm))
                .await
                .map_err(destroy_error)?;
            info!(vm, "vSphere clone deleted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests;
