//! [`ContainerApi`] backed by the Docker Engine API through `bollard`.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{ContainerInspectResponse, HostConfig};
use bollard::{API_DEFAULT_VERSION, Docker};
use camino::Utf8PathBuf;
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::host_spec::DockerSpec;

use super::{ContainerApi, ContainerDetails, ContainerRequest, EngineError, EngineFuture};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// How the engine endpoint is reached.
#[derive(Clone, Debug)]
enum Endpoint {
    Unix(String),
    Http(String),
    Tls {
        address: String,
        certificates: Utf8PathBuf,
    },
}

impl Endpoint {
    fn connect(&self) -> Result<Docker, bollard::errors::Error> {
        match self {
            Self::Unix(host) => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Self::Http(host) => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Self::Tls {
                address,
                certificates,
            } => Docker::connect_with_ssl(
                address,
                certificates.join("key.pem").as_std_path(),
                certificates.join("cert.pem").as_std_path(),
                certificates.join("ca.pem").as_std_path(),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
        }
    }
}

/// Docker Engine client.
///
/// The connection is opened on first use, so an unreachable engine fails
/// the operation that needed it rather than driver construction.
#[derive(Clone, Debug)]
pub struct BollardEngine {
    endpoint: Endpoint,
    client: OnceCell<Docker>,
}

impl BollardEngine {
    /// Validates the endpoint named by `dockerHost`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when the endpoint scheme is not
    /// supported or an `https://` endpoint has no `certificates` directory.
    pub fn new(spec: &DockerSpec) -> Result<Self, BackendError> {
        let host = spec.host.as_str();
        let endpoint = if host.starts_with("unix://") {
            Endpoint::Unix(host.to_owned())
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Endpoint::Http(host.to_owned())
        } else if host.starts_with("https://") {
            let certificates = spec.certificates.clone().ok_or_else(|| {
                BackendError::Config(ConfigError::MissingKey {
                    key: String::from("certificates"),
                })
            })?;
            Endpoint::Tls {
                address: host.replacen("https://", "tcp://", 1),
                certificates,
            }
        } else {
            return Err(invalid_host(host, "expected unix://, tcp://, http://, or https://"));
        };
        Ok(Self {
            endpoint,
            client: OnceCell::new(),
        })
    }

    async fn docker(&self) -> Result<&Docker, EngineError> {
        self.client
            .get_or_try_init(|| async {
                debug!(endpoint = ?self.endpoint, "connecting to container engine");
                self.endpoint.connect().map_err(|err| EngineError::Engine {
                    message: format!("cannot reach container engine: {err}"),
                })
            })
            .await
    }
}

fn invalid_host(host: &str, reason: &str) -> BackendError {
    BackendError::Config(ConfigError::InvalidValue {
        key: String::from("dockerHost"),
        value: host.to_owned(),
        reason: reason.to_owned(),
    })
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound { message },
            bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            } => Self::NotRunning,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } if message.contains("is not running") => Self::NotRunning,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => Self::Conflict { message },
            other => Self::Engine {
                message: other.to_string(),
            },
        }
    }
}

/// Splits `repository[:tag]`, leaving registry ports alone.
pub(super) fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (image, "latest"),
    }
}

fn container_config(request: &ContainerRequest) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = request
        .exposed_ports
        .iter()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();
    Config {
        image: Some(request.image.clone()),
        cmd: (!request.command.is_empty()).then(|| request.command.clone()),
        env: (!request.env.is_empty()).then(|| request.env.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            publish_all_ports: Some(request.publish_all_ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn details(response: ContainerInspectResponse) -> ContainerDetails {
    let running = response
        .state
        .as_ref()
        .and_then(|state| state.running)
        .unwrap_or(false);
    let settings = response.network_settings.unwrap_or_default();
    let ip_address = settings
        .ip_address
        .clone()
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            settings.networks.as_ref().and_then(|networks| {
                networks
                    .values()
                    .find_map(|endpoint| endpoint.ip_address.clone().filter(|ip| !ip.is_empty()))
            })
        });
    let mut published: Vec<(u16, u16)> = settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(port, bindings)| {
            let guest = port.strip_suffix("/tcp")?.parse().ok()?;
            let host = bindings?
                .into_iter()
                .find_map(|binding| binding.host_port?.parse().ok())?;
            Some((guest, host))
        })
        .collect();
    published.sort_unstable();

    ContainerDetails {
        id: response.id.unwrap_or_default(),
        running,
        ip_address,
        published,
    }
}

impl ContainerApi for BollardEngine {
    fn image_present<'a>(&'a self, image: &'a str) -> EngineFuture<'a, bool> {
        Box::pin(async move {
            match self.docker().await?.inspect_image(image).await {
                Ok(_) => Ok(true),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => Ok(false),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn pull<'a>(&'a self, image: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let (repository, tag) = split_image(image);
            let options = CreateImageOptions {
                from_image: repository,
                tag,
                ..Default::default()
            };
            let docker = self.docker().await?;
            let mut stream = docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                let info = progress?;
                if let Some(message) = info.error {
                    return Err(EngineError::Engine { message });
                }
                if let Some(status) = info.status {
                    debug!(image, status, "pull progress");
                }
            }
            Ok(())
        })
    }

    fn create<'a>(&'a self, request: &'a ContainerRequest) -> EngineFuture<'a, String> {
        Box::pin(async move {
            let options = request.name.as_deref().map(|name| CreateContainerOptions {
                name,
                platform: None,
            });
            let response = self
                .docker()
                .await?
                .create_container(options, container_config(request))
                .await?;
            Ok(response.id)
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.docker()
                .await?
                .start_container(id, None::<StartContainerOptions<String>>)
                .await?;
            Ok(())
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ContainerDetails> {
        Box::pin(async move {
            let response = self.docker().await?.inspect_container(id, None).await?;
            Ok(details(response))
        })
    }

    fn kill<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.docker()
                .await?
                .kill_container(id, None::<KillContainerOptions<String>>)
                .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str, volumes: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = RemoveContainerOptions {
                force: true,
                v: volumes,
                link: false,
            };
            self.docker().await?.remove_container(id, Some(options)).await?;
            Ok(())
        })
    }
}
