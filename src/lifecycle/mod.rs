//! Host lifecycle orchestration.
//!
//! [`HostOrchestrator::acquire`] drives one [`HostHandle`] through
//! `Creating → AwaitingAddress → Tunneling → Provisioning → Ready`. Any
//! failure, including a caller abort through [`Cancellation`], tears the
//! backend instance down before the error is returned; the handle then rests
//! in [`HostState::Failed`]. [`HostHandle::teardown`] is idempotent and is the
//! only way to reach [`HostState::TornDown`].
//!
//! Backends that keep provisioned images ([`ProvisionReuse::Images`]) are
//! asked for an image matching the expiration tag before anything is
//! created. A hit starts the host from that image and skips provisioning; a
//! miss provisions a fresh instance, keeps it as an image, and continues on
//! a clone of it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFactory, HostAddress, ImageCache,
    InstanceHandle, ProvisionReuse,
};
use crate::config::{ConfigError, OvercastConfig};
use crate::drivers::DriverFactory;
use crate::exec::{CommandRunner, ProcessCommandRunner, RemoteExecutor, SshExecutor};
use crate::host_spec::{HostSpec, ProvisionSpec};
use crate::provision::{
    FileTagStore, ProvisionError, ProvisionOutcome, ProvisioningEngine, TagStore,
};
use crate::resolve::{AddressResolver, ResolveError};
use crate::tunnel::{
    SshTunnelLauncher, Tunnel, TunnelError, TunnelLauncher, TunnelManager, TunnelSpec,
};

mod session;

pub use session::{HostRegistry, Session};

const TUNNEL_HOST: &str = "localhost";

/// Lifecycle position of a host.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HostState {
    /// Nothing has been created yet.
    #[default]
    Unprovisioned,
    /// The backend is creating the instance.
    Creating,
    /// Waiting for the instance address.
    AwaitingAddress,
    /// Establishing port forwarding.
    Tunneling,
    /// Running the provisioning protocol.
    Provisioning,
    /// The host is usable.
    Ready,
    /// Acquisition or teardown failed.
    Failed,
    /// The backend instance has been released.
    TornDown,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Creating => "creating",
            Self::AwaitingAddress => "awaiting address",
            Self::Tunneling => "tunneling",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::TornDown => "torn down",
        };
        f.write_str(name)
    }
}

/// Caller-facing classification of lifecycle failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The backend rejected or failed the create, clone, or start request.
    CreationFailed,
    /// No address was found within the lookup timeout.
    AddressResolutionTimeout,
    /// The backend could not report an address.
    AddressResolutionFailed,
    /// The tunnel never became usable.
    TunnelSetupTimeout,
    /// Provisioning attempts were exhausted.
    ProvisioningTimeout,
    /// Provisioning failed without retrying, such as an expiration tag
    /// command error.
    ProvisioningFailed,
    /// The host configuration, or the way it was used, is invalid.
    ConfigurationError,
    /// A live resource could not be destroyed.
    DestroyFailed,
    /// The caller aborted the operation.
    Cancelled,
}

/// Errors raised while acquiring or releasing hosts.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Host properties could not be interpreted.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The backend could not create the instance.
    #[error("host {label}: {source}")]
    Creation {
        /// Host label.
        label: String,
        /// Backend failure.
        #[source]
        source: BackendError,
    },
    /// The backend could not report the instance address.
    #[error("host {label}: {source}")]
    Address {
        /// Host label.
        label: String,
        /// Backend failure.
        #[source]
        source: BackendError,
    },
    /// The backend asked for an address lookup but no strategy is
    /// configured.
    #[error("host {label} needs an ipLookupStrategy to find its address")]
    MissingLookupStrategy {
        /// Host label.
        label: String,
    },
    /// Address lookup failed.
    #[error("host {label}: {source}")]
    Resolve {
        /// Host label.
        label: String,
        /// Resolver failure.
        #[source]
        source: ResolveError,
    },
    /// The tunnel could not be established.
    #[error("host {label}: {source}")]
    Tunnel {
        /// Host label.
        label: String,
        /// Tunnel failure.
        #[source]
        source: TunnelError,
    },
    /// Provisioning failed.
    #[error("host {label}: {source}")]
    Provision {
        /// Host label.
        label: String,
        /// Provisioning failure.
        #[source]
        source: ProvisionError,
    },
    /// Destroying a live instance failed.
    #[error("host {label}: {source}")]
    Destroy {
        /// Host label.
        label: String,
        /// Backend failure.
        #[source]
        source: BackendError,
    },
    /// The caller aborted acquisition.
    #[error("host {label}: cancelled while {state}")]
    Cancelled {
        /// Host label.
        label: String,
        /// State the host was in when the abort arrived.
        state: HostState,
    },
    /// A failure triggered teardown and teardown failed too.
    #[error("{original} (teardown also failed: {teardown})")]
    TeardownAfterFailure {
        /// The failure that triggered teardown.
        original: Box<LifecycleError>,
        /// The teardown failure.
        teardown: BackendError,
    },
    /// A port was requested that the host's tunnel does not forward.
    #[error("host {label} does not forward port {port}")]
    PortNotForwarded {
        /// Host label.
        label: String,
        /// Requested remote port.
        port: u16,
    },
    /// The host is not in a state that allows the operation.
    #[error("host {label} is {state}")]
    InvalidState {
        /// Host label.
        label: String,
        /// Current state.
        state: HostState,
    },
    /// Two hosts share a label within one session.
    #[error("host label {label} is already registered")]
    DuplicateLabel {
        /// Offending label.
        label: String,
    },
    /// A host task panicked or stopped before reporting a result.
    #[error("host {label}: task aborted: {message}")]
    Task {
        /// Host label.
        label: String,
        /// Panic message or join failure description.
        message: String,
    },
}

impl LifecycleError {
    /// Classifies the error.
    ///
    /// A teardown that fails after another failure reports the kind of the
    /// original failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::MissingLookupStrategy { .. }
            | Self::PortNotForwarded { .. }
            | Self::InvalidState { .. }
            | Self::DuplicateLabel { .. } => ErrorKind::ConfigurationError,
            Self::Creation { source, .. } => match source {
                BackendError::Config(_) => ErrorKind::ConfigurationError,
                _ => ErrorKind::CreationFailed,
            },
            Self::Address { .. } => ErrorKind::AddressResolutionFailed,
            Self::Resolve { source, .. } => match source {
                ResolveError::Timeout { .. } => ErrorKind::AddressResolutionTimeout,
                ResolveError::Target(_) => ErrorKind::ConfigurationError,
            },
            Self::Tunnel { source, .. } => match source {
                TunnelError::InvalidPorts(_) => ErrorKind::ConfigurationError,
                TunnelError::Launch { .. } | TunnelError::SetupTimeout { .. } => {
                    ErrorKind::TunnelSetupTimeout
                }
            },
            Self::Provision { source, .. } => match source {
                ProvisionError::Timeout { .. } => ErrorKind::ProvisioningTimeout,
                ProvisionError::Target(_) => ErrorKind::ConfigurationError,
                ProvisionError::ExpirationTag { .. } | ProvisionError::TagStore { .. } => {
                    ErrorKind::ProvisioningFailed
                }
            },
            Self::Destroy { .. } => ErrorKind::DestroyFailed,
            Self::Cancelled { .. } | Self::Task { .. } => ErrorKind::Cancelled,
            Self::TeardownAfterFailure { original, .. } => original.kind(),
        }
    }
}

/// Triggers a [`Cancellation`].
#[derive(Debug)]
pub struct Canceller {
    sender: watch::Sender<bool>,
}

impl Canceller {
    /// Aborts every operation watching the paired [`Cancellation`].
    pub fn cancel(&self) {
        self.sender.send_modify(|cancelled| *cancelled = true);
    }
}

/// Caller-initiated abort signal observed by acquisition.
#[derive(Clone, Debug)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    /// Creates a linked canceller and cancellation.
    #[must_use]
    pub fn new() -> (Canceller, Self) {
        let (sender, receiver) = watch::channel(false);
        (Canceller { sender }, Self { receiver })
    }

    /// A cancellation that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_, cancellation) = Self::new();
        cancellation
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when cancellation is requested; never completes if the
    /// canceller is dropped first.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// One host and everything acquired for it.
pub struct HostHandle {
    spec: Arc<HostSpec>,
    backend: Arc<dyn Backend>,
    state: HostState,
    instance: Option<InstanceHandle>,
    address: Option<HostAddress>,
    tunnel: Option<Tunnel>,
    provisioned: Option<ProvisionOutcome>,
}

impl HostHandle {
    /// Creates an unprovisioned handle driven by `backend`.
    #[must_use]
    pub fn new(spec: HostSpec, backend: Arc<dyn Backend>) -> Self {
        Self {
            spec: Arc::new(spec),
            backend,
            state: HostState::Unprovisioned,
            instance: None,
            address: None,
            tunnel: None,
            provisioned: None,
        }
    }

    /// Host label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    /// Host specification.
    #[must_use]
    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> HostState {
        self.state
    }

    /// Backend instance, while one exists.
    #[must_use]
    pub const fn instance(&self) -> Option<&InstanceHandle> {
        self.instance.as_ref()
    }

    /// Resolved address of the instance.
    #[must_use]
    pub const fn address(&self) -> Option<&HostAddress> {
        self.address.as_ref()
    }

    /// Outcome of provisioning, when it ran.
    #[must_use]
    pub const fn provisioned(&self) -> Option<&ProvisionOutcome> {
        self.provisioned.as_ref()
    }

    /// Host and port a client dials to reach `port` on this host.
    ///
    /// Tunnelled hosts are reached on `localhost` through the forwarded
    /// local port; other hosts through the backend's port translations.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidState`] before an address is known
    /// and [`LifecycleError::PortNotForwarded`] when the tunnel does not
    /// forward `port`.
    pub fn endpoint(&self, port: u16) -> Result<(String, u16), LifecycleError> {
        let address = self
            .address
            .as_ref()
            .ok_or_else(|| self.invalid_state())?;
        match &self.tunnel {
            Some(tunnel) => tunnel
                .local_port(port)
                .map(|local| (String::from(TUNNEL_HOST), local))
                .ok_or_else(|| LifecycleError::PortNotForwarded {
                    label: self.label().to_owned(),
                    port,
                }),
            None => Ok((address.host.clone(), address.port(port))),
        }
    }

    /// Releases everything acquired for the host.
    ///
    /// Closes the tunnel and destroys the backend instance. An instance the
    /// backend reports as already gone counts as destroyed, and calling this
    /// on a torn-down handle does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Destroy`] when a live instance could not be
    /// destroyed; the handle is left [`HostState::Failed`] and can be torn
    /// down again.
    pub async fn teardown(&mut self) -> Result<(), LifecycleError> {
        if self.state == HostState::TornDown {
            debug!(host = %self.label(), "host already torn down");
            return Ok(());
        }
        match self.release().await {
            Ok(()) => {
                self.state = HostState::TornDown;
                info!(host = %self.label(), "host torn down");
                Ok(())
            }
            Err(source) => {
                self.state = HostState::Failed;
                Err(LifecycleError::Destroy {
                    label: self.label().to_owned(),
                    source,
                })
            }
        }
    }

    async fn release(&mut self) -> Result<(), BackendError> {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close();
            debug!(host = %self.label(), "tunnel closed");
        }
        let Some(instance) = self.instance.as_ref() else {
            return Ok(());
        };
        match self.backend.destroy(instance).await {
            Ok(()) => info!(host = %self.spec.label, instance = %instance.id, "instance destroyed"),
            Err(err) if err.is_gone() => {
                debug!(host = %self.spec.label, instance = %instance.id, "instance already gone");
            }
            Err(err) => return Err(err),
        }
        self.instance = None;
        Ok(())
    }

    fn transition(&mut self, next: HostState) {
        debug!(host = %self.label(), from = %self.state, to = %next, "host state change");
        self.state = next;
    }

    fn invalid_state(&self) -> LifecycleError {
        LifecycleError::InvalidState {
            label: self.label().to_owned(),
            state: self.state,
        }
    }

    fn cancelled(&self) -> LifecycleError {
        LifecycleError::Cancelled {
            label: self.label().to_owned(),
            state: self.state,
        }
    }

    fn panicked(&self, payload: &(dyn Any + Send)) -> LifecycleError {
        let message = payload
            .downcast_ref::<&str>()
            .map(|text| (*text).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| String::from("non-string panic payload"));
        LifecycleError::Task {
            label: self.label().to_owned(),
            message: format!("panicked: {message}"),
        }
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("label", &self.spec.label)
            .field("kind", &self.backend.kind())
            .field("state", &self.state)
            .field("instance", &self.instance)
            .field("address", &self.address)
            .field("tunnel", &self.tunnel)
            .finish_non_exhaustive()
    }
}

/// Races `step` against `cancel`.
async fn until_cancelled<T, F>(
    cancel: &Cancellation,
    on_cancel: LifecycleError,
    step: F,
) -> Result<T, LifecycleError>
where
    F: Future<Output = Result<T, LifecycleError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(on_cancel),
        result = step => result,
    }
}

/// Where a new instance comes from.
enum ImagePlan<'a> {
    /// Create from the backend's base; provisioning, if any, runs normally.
    Plain,
    /// An image provisioned under `tag` exists: clone it and skip
    /// provisioning.
    Reuse {
        cache: &'a dyn ImageCache,
        image: String,
        tag: String,
    },
    /// Provision an instance of the base, keep it as an image, and hand out
    /// a clone of that image.
    Build {
        cache: &'a dyn ImageCache,
        tag: String,
    },
}

/// Acquires hosts by driving their backend, resolver, tunnel, and
/// provisioning steps in order.
pub struct HostOrchestrator<L = SshTunnelLauncher> {
    factory: Arc<dyn BackendFactory>,
    resolver: AddressResolver,
    tunnels: TunnelManager<L>,
    provisioner: ProvisioningEngine,
}

impl HostOrchestrator<SshTunnelLauncher> {
    /// Wires production collaborators from the global configuration.
    #[must_use]
    pub fn from_config(config: &OvercastConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner);
        let executor: Arc<dyn RemoteExecutor> =
            Arc::new(SshExecutor::new(config.ssh_settings(), ProcessCommandRunner));
        let tags: Arc<dyn TagStore> = Arc::new(FileTagStore::new(config.tag_store_file()));
        Self::new(
            Arc::new(DriverFactory::new(config.clone(), Arc::clone(&runner))),
            AddressResolver::new(Arc::clone(&executor)),
            TunnelManager::new(SshTunnelLauncher::new(config.ssh_settings())),
            ProvisioningEngine::new(executor, runner, tags),
        )
    }
}

impl<L: TunnelLauncher> HostOrchestrator<L> {
    /// Creates an orchestrator from its collaborators.
    #[must_use]
    pub const fn new(
        factory: Arc<dyn BackendFactory>,
        resolver: AddressResolver,
        tunnels: TunnelManager<L>,
        provisioner: ProvisioningEngine,
    ) -> Self {
        Self {
            factory,
            resolver,
            tunnels,
            provisioner,
        }
    }

    /// Builds the backend for `spec` and returns an unprovisioned handle.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Creation`] when no driver can be built for
    /// the specification.
    pub fn prepare(&self, spec: HostSpec) -> Result<HostHandle, LifecycleError> {
        let backend = self
            .factory
            .build(&spec)
            .map_err(|source| LifecycleError::Creation {
                label: spec.label.clone(),
                source,
            })?;
        Ok(HostHandle::new(spec, backend))
    }

    /// Brings `host` to [`HostState::Ready`].
    ///
    /// On failure, cancellation, or a panic inside a backend step the
    /// instance is destroyed before the error is returned and the handle is
    /// left [`HostState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns the failure of the step that stopped acquisition. When the
    /// teardown that follows also fails, both are reported through
    /// [`LifecycleError::TeardownAfterFailure`], original cause first.
    pub async fn acquire(
        &self,
        host: &mut HostHandle,
        cancel: &Cancellation,
    ) -> Result<(), LifecycleError> {
        if host.state != HostState::Unprovisioned {
            return Err(host.invalid_state());
        }
        let outcome = AssertUnwindSafe(self.bring_up(host, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(host.panicked(payload.as_ref())));
        match outcome {
            Ok(()) => {
                host.transition(HostState::Ready);
                info!(
                    host = %host.label(),
                    address = ?host.address.as_ref().map(|address| address.host.as_str()),
                    "host ready"
                );
                Ok(())
            }
            Err(err) => Err(Self::fail(host, err).await),
        }
    }

    async fn fail(host: &mut HostHandle, err: LifecycleError) -> LifecycleError {
        warn!(host = %host.label(), state = %host.state, error = %err, "host acquisition failed");
        host.state = HostState::Failed;
        match host.release().await {
            Ok(()) => err,
            Err(teardown) => {
                warn!(host = %host.label(), error = %teardown, "teardown after failure failed");
                LifecycleError::TeardownAfterFailure {
                    original: Box::new(err),
                    teardown,
                }
            }
        }
    }

    async fn bring_up(
        &self,
        host: &mut HostHandle,
        cancel: &Cancellation,
    ) -> Result<(), LifecycleError> {
        let spec = Arc::clone(&host.spec);
        let backend = Arc::clone(&host.backend);
        let label = spec.label.as_str();

        host.transition(HostState::Creating);
        if cancel.is_cancelled() {
            return Err(host.cancelled());
        }
        let plan = until_cancelled(
            cancel,
            host.cancelled(),
            self.image_plan(&spec, backend.as_ref()),
        )
        .await?;
        // Create runs to completion so that a late abort still knows what to
        // destroy.
        let created = match &plan {
            ImagePlan::Reuse { cache, image, .. } => cache.create_from(image).await,
            ImagePlan::Plain | ImagePlan::Build { .. } => backend.create().await,
        };
        let instance = created.map_err(|source| LifecycleError::Creation {
            label: label.to_owned(),
            source,
        })?;
        info!(host = label, instance = %instance.id, kind = %backend.kind(), "instance created");
        host.instance = Some(instance.clone());
        if cancel.is_cancelled() {
            return Err(host.cancelled());
        }

        host.transition(HostState::AwaitingAddress);
        let address = until_cancelled(
            cancel,
            host.cancelled(),
            self.resolve_address(&spec, backend.as_ref(), &instance),
        )
        .await?;
        host.address = Some(address.clone());

        if let Some(tunnel_spec) = &spec.tunnel {
            host.transition(HostState::Tunneling);
            let tunnel = until_cancelled(
                cancel,
                host.cancelled(),
                self.open_tunnel(label, &address, tunnel_spec),
            )
            .await?;
            host.tunnel = Some(tunnel);
        }

        let Some(provision) = &spec.provision else {
            return Ok(());
        };
        host.transition(HostState::Provisioning);
        let outcome = match plan {
            ImagePlan::Reuse { image, tag, .. } => {
                info!(host = label, image, tag, "cloned from provisioned image; skipping provisioning");
                ProvisionOutcome::Cached { tag }
            }
            ImagePlan::Build { cache, tag } => {
                self.provision_image(host, cache, tag, cancel).await?
            }
            ImagePlan::Plain => {
                let reuse = backend.provision_reuse();
                until_cancelled(cancel, host.cancelled(), async {
                    self.provision_plain(&spec, reuse, &address.host, provision)
                        .await
                        .map_err(|source| LifecycleError::Provision {
                            label: label.to_owned(),
                            source,
                        })
                })
                .await?
            }
        };
        host.provisioned = Some(outcome);
        Ok(())
    }

    /// Decides where the instance comes from. Only backends that keep
    /// images and hosts with an expiration tag take the image route.
    async fn image_plan<'a>(
        &self,
        spec: &HostSpec,
        backend: &'a dyn Backend,
    ) -> Result<ImagePlan<'a>, LifecycleError> {
        let ProvisionReuse::Images(cache) = backend.provision_reuse() else {
            return Ok(ImagePlan::Plain);
        };
        let Some(provision) = &spec.provision else {
            return Ok(ImagePlan::Plain);
        };
        let computed = self
            .provisioner
            .expiration_tag(provision)
            .await
            .map_err(|source| LifecycleError::Provision {
                label: spec.label.clone(),
                source,
            })?;
        let Some(tag) = computed else {
            return Ok(ImagePlan::Plain);
        };
        let image = cache
            .find(&spec.cache_key(), &tag)
            .await
            .map_err(|source| LifecycleError::Creation {
                label: spec.label.clone(),
                source,
            })?;
        debug!(host = %spec.label, tag, image = ?image, "looked up provisioned image");
        Ok(match image {
            Some(found) => ImagePlan::Reuse {
                cache,
                image: found,
                tag,
            },
            None => ImagePlan::Build { cache, tag },
        })
    }

    async fn provision_plain(
        &self,
        spec: &HostSpec,
        reuse: ProvisionReuse<'_>,
        address: &str,
        provision: &ProvisionSpec,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        if matches!(reuse, ProvisionReuse::SameMachine) {
            return self
                .provisioner
                .provision(&spec.cache_key(), address, provision)
                .await;
        }
        let tag = self.provisioner.expiration_tag(provision).await?;
        self.provisioner.run(address, provision).await?;
        info!(host = %spec.label, "provisioning finished");
        Ok(ProvisionOutcome::Provisioned { tag })
    }

    /// Provisions the fresh instance, keeps it as an image stamped with
    /// `tag`, and replaces it with a clone of that image.
    async fn provision_image(
        &self,
        host: &mut HostHandle,
        cache: &dyn ImageCache,
        tag: String,
        cancel: &Cancellation,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let spec = Arc::clone(&host.spec);
        let backend = Arc::clone(&host.backend);
        let label = spec.label.as_str();
        let provision = spec.provision.as_ref().ok_or_else(|| host.invalid_state())?;
        let address = host.address.clone().ok_or_else(|| host.invalid_state())?;
        let creation = |source: BackendError| LifecycleError::Creation {
            label: label.to_owned(),
            source,
        };

        until_cancelled(cancel, host.cancelled(), async {
            self.provisioner
                .run(&address.host, provision)
                .await
                .map_err(|source| LifecycleError::Provision {
                    label: label.to_owned(),
                    source,
                })
        })
        .await?;

        if let Some(mut tunnel) = host.tunnel.take() {
            tunnel.close();
        }
        let provisioned = host.instance.clone().ok_or_else(|| host.invalid_state())?;
        let image = cache
            .capture(&provisioned, &spec.cache_key(), &tag)
            .await
            .map_err(creation)?;
        host.instance = None;
        host.address = None;
        info!(host = label, image, tag, "kept provisioned instance as image");

        let instance = cache.create_from(&image).await.map_err(creation)?;
        info!(host = label, instance = %instance.id, image, "instance cloned from image");
        host.instance = Some(instance.clone());
        if cancel.is_cancelled() {
            return Err(host.cancelled());
        }
        let reached = until_cancelled(
            cancel,
            host.cancelled(),
            self.resolve_address(&spec, backend.as_ref(), &instance),
        )
        .await?;
        host.address = Some(reached.clone());
        if let Some(tunnel_spec) = &spec.tunnel {
            let tunnel = until_cancelled(
                cancel,
                host.cancelled(),
                self.open_tunnel(label, &reached, tunnel_spec),
            )
            .await?;
            host.tunnel = Some(tunnel);
        }
        Ok(ProvisionOutcome::Provisioned { tag: Some(tag) })
    }

    async fn open_tunnel(
        &self,
        label: &str,
        address: &HostAddress,
        tunnel_spec: &TunnelSpec,
    ) -> Result<Tunnel, LifecycleError> {
        self.tunnels
            .establish(&address.host, tunnel_spec)
            .await
            .map_err(|source| LifecycleError::Tunnel {
                label: label.to_owned(),
                source,
            })
    }

    async fn resolve_address(
        &self,
        spec: &HostSpec,
        backend: &dyn Backend,
        instance: &InstanceHandle,
    ) -> Result<HostAddress, LifecycleError> {
        let label = spec.label.as_str();
        let reported = backend
            .address(instance)
            .await
            .map_err(|source| LifecycleError::Address {
                label: label.to_owned(),
                source,
            })?;
        match reported {
            AddressSource::Resolved(address) => Ok(address),
            AddressSource::Lookup { key } => {
                let strategy = spec.ip_lookup.as_ref().ok_or_else(|| {
                    LifecycleError::MissingLookupStrategy {
                        label: label.to_owned(),
                    }
                })?;
                let ip = self
                    .resolver
                    .resolve(strategy, &key)
                    .await
                    .map_err(|source| LifecycleError::Resolve {
                        label: label.to_owned(),
                        source,
                    })?;
                Ok(HostAddress::new(ip))
            }
        }
    }
}

impl<L> fmt::Debug for HostOrchestrator<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostOrchestrator")
            .field("resolver", &self.resolver)
            .field("provisioner", &self.provisioner)
            .finish_non_exhaustive()
    }
}
