//! Containers run through the Docker Engine API.
//!
//! The driver talks to the engine through [`ContainerApi`]; production code
//! uses [`BollardEngine`]. A configured container name is passed through to
//! the engine, which rejects duplicates, and such a collision fails creation
//! immediately.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFuture, BackendKind, HostAddress,
    InstanceHandle,
};
use crate::host_spec::DockerSpec;

mod engine;

pub use engine::BollardEngine;

const KIND: BackendKind = BackendKind::Container;
const LOCAL_ENGINE_HOST: &str = "127.0.0.1";

/// Errors reported by a container engine.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EngineError {
    /// The container or image does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Engine message.
        message: String,
    },
    /// The request conflicts with existing state, such as a taken name.
    #[error("conflict: {message}")]
    Conflict {
        /// Engine message.
        message: String,
    },
    /// The container is not running.
    #[error("container is not running")]
    NotRunning,
    /// Any other engine failure.
    #[error("{message}")]
    Engine {
        /// Engine message.
        message: String,
    },
}

/// Future returned by [`ContainerApi`] operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// Parameters of a container to create.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContainerRequest {
    /// Container name, or `None` for an engine-assigned one.
    pub name: Option<String>,
    /// Image reference.
    pub image: String,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Ports to expose, such as `8080/tcp`.
    pub exposed_ports: Vec<String>,
    /// Publish every exposed port on a random host port.
    pub publish_all_ports: bool,
}

impl ContainerRequest {
    /// Builds the request described by a container host specification.
    #[must_use]
    pub fn from_spec(spec: &DockerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            image: spec.image.clone(),
            command: spec.command.clone(),
            env: spec.env.clone(),
            exposed_ports: spec.exposed_ports.clone(),
            publish_all_ports: spec.expose_all_ports,
        }
    }
}

/// What the engine reports about a created container.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContainerDetails {
    /// Container identifier.
    pub id: String,
    /// Whether the container is running.
    pub running: bool,
    /// Address on the container network, if any.
    pub ip_address: Option<String>,
    /// `(container port, host port)` pairs of published TCP ports.
    pub published: Vec<(u16, u16)>,
}

/// Container engine operations used by [`DockerDriver`].
pub trait ContainerApi: Send + Sync {
    /// Returns whether `image` is available locally.
    fn image_present<'a>(&'a self, image: &'a str) -> EngineFuture<'a, bool>;

    /// Pulls `image` from its registry.
    fn pull<'a>(&'a self, image: &'a str) -> EngineFuture<'a, ()>;

    /// Creates a container and returns its identifier.
    fn create<'a>(&'a self, request: &'a ContainerRequest) -> EngineFuture<'a, String>;

    /// Starts a created container.
    fn start<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()>;

    /// Reports the state and network settings of a container.
    fn inspect<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ContainerDetails>;

    /// Kills a running container.
    fn kill<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()>;

    /// Removes a container, along with its anonymous volumes when
    /// `volumes` is set.
    fn remove<'a>(&'a self, id: &'a str, volumes: bool) -> EngineFuture<'a, ()>;
}

/// Host name of the engine endpoint, used when ports are published on it.
fn engine_host(endpoint: &str) -> String {
    if endpoint.starts_with("unix://") {
        return String::from(LOCAL_ENGINE_HOST);
    }
    let normalized = endpoint.replacen("tcp://", "http://", 1);
    reqwest::Url::parse(&normalized)
        .ok()
        .and_then(|url| url.host_str().map(ToOwned::to_owned))
        .unwrap_or_else(|| String::from(LOCAL_ENGINE_HOST))
}

/// Starts one container per host.
pub struct DockerDriver {
    spec: DockerSpec,
    api: Arc<dyn ContainerApi>,
}

impl DockerDriver {
    /// Creates a driver using `api` to reach the engine.
    #[must_use]
    pub const fn new(spec: DockerSpec, api: Arc<dyn ContainerApi>) -> Self {
        Self { spec, api }
    }

    async fn ensure_image(&self) -> Result<(), EngineError> {
        if self.api.image_present(&self.spec.image).await? {
            return Ok(());
        }
        info!(image = %self.spec.image, "pulling missing image");
        self.api.pull(&self.spec.image).await
    }

    async fn discard(&self, id: &str) {
        if let Err(err) = self.api.remove(id, true).await {
            warn!(container = id, error = %err, "could not remove container after failed start");
        }
    }
}

impl std::fmt::Debug for DockerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerDriver")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl Backend for DockerDriver {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        Box::pin(async move {
            self.ensure_image()
                .await
                .map_err(|err| BackendError::creation(KIND, format!("image {}: {err}", self.spec.image)))?;

            let request = ContainerRequest::from_spec(&self.spec);
            let id = self.api.create(&request).await.map_err(|err| match err {
                EngineError::Conflict { message } => BackendError::creation(
                    KIND,
                    format!(
                        "container name {} is already in use: {message}",
                        self.spec.name.as_deref().unwrap_or_default()
                    ),
                ),
                other => BackendError::creation(KIND, other),
            })?;

            if let Err(err) = self.api.start(&id).await {
                self.discard(&id).await;
                return Err(BackendError::creation(KIND, format!("start {id}: {err}")));
            }
            info!(container = %id, image = %self.spec.image, "container started");
            Ok(InstanceHandle::new(id))
        })
    }

    fn address<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        Box::pin(async move {
            let details = self
                .api
                .inspect(&handle.id)
                .await
                .map_err(|err| BackendError::address(KIND, &handle.id, err))?;
            debug!(container = %handle.id, ?details, "inspected container");

            let address = if details.published.is_empty() {
                HostAddress::new(
                    details
                        .ip_address
                        .unwrap_or_else(|| engine_host(&self.spec.host)),
                )
            } else {
                details.published.iter().fold(
                    HostAddress::new(engine_host(&self.spec.host)),
                    |address, &(guest, published)| address.with_port(guest, published),
                )
            };
            Ok(AddressSource::Resolved(address))
        })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let id = handle.id.as_str();
            let details = match self.api.inspect(id).await {
                Ok(details) => details,
                Err(EngineError::NotFound { .. }) => {
                    return Err(BackendError::Gone {
                        kind: KIND,
                        id: id.to_owned(),
                    });
                }
                Err(err) => return Err(BackendError::destroy(KIND, id, err)),
            };

            if details.running {
                match self.api.kill(id).await {
                    Ok(()) | Err(EngineError::NotRunning) => {}
                    Err(err) => return Err(BackendError::destroy(KIND, id, err)),
                }
                info!(container = id, "container stopped");
            }
            if self.spec.remove {
                self.api
                    .remove(id, self.spec.remove_volume)
                    .await
                    .map_err(|err| BackendError::destroy(KIND, id, err))?;
                info!(container = id, volumes = self.spec.remove_volume, "container removed");
            }
            Ok(())
        })
    }
}
