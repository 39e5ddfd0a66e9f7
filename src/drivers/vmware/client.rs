//! vSphere Automation REST client.

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::host_spec::{TlsPolicy, VmwareSpec};

use super::{VsphereApi, VsphereError, VsphereFuture};

const SESSION_HEADER: &str = "vmware-api-session-id";
const POWERED_ON: &str = "POWERED_ON";

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    #[serde(default)]
    ip_address: Option<String>,
}

/// Talks to vCenter over HTTPS with a per-request timeout.
#[derive(Clone, Debug)]
pub struct RestVsphereClient {
    http: reqwest::Client,
    base: Url,
    auth_hash: String,
}

/// Normalizes `vmwareApiHost` to a base URL ending in `/`.
pub(super) fn api_base(host: &str) -> Result<Url, String> {
    let with_scheme = if host.contains("://") {
        host.to_owned()
    } else {
        format!("https://{host}")
    };
    let with_slash = if with_scheme.ends_with('/') {
        with_scheme
    } else {
        format!("{with_scheme}/")
    };
    Url::parse(&with_slash).map_err(|err| err.to_string())
}

impl RestVsphereClient {
    /// Builds a client for the endpoint in `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when the host is not a valid URL or
    /// the HTTP client cannot be built.
    pub fn new(spec: &VmwareSpec) -> Result<Self, BackendError> {
        let invalid = |reason: String| {
            BackendError::Config(ConfigError::InvalidValue {
                key: String::from("vmwareApiHost"),
                value: spec.api_host.clone(),
                reason,
            })
        };
        let base = api_base(&spec.api_host).map_err(invalid)?;

        let defaults = reqwest::Client::builder()
            .timeout(spec.start_timeout)
            .danger_accept_invalid_certs(spec.ignore_bad_certificate);
        let builder = match spec.security_algorithm {
            TlsPolicy::Default => defaults,
            TlsPolicy::Tls12 => defaults.min_tls_version(reqwest::tls::Version::TLS_1_2),
            TlsPolicy::Tls13 => defaults.min_tls_version(reqwest::tls::Version::TLS_1_3),
        };
        let http = builder.build().map_err(|err| invalid(err.to_string()))?;

        Ok(Self {
            http,
            base,
            auth_hash: spec.auth_hash.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, VsphereError> {
        let url = self.base.join(path).map_err(|err| VsphereError::Rejected {
            message: format!("invalid path {path}: {err}"),
        })?;
        Ok(self.http.request(method, url))
    }

    fn authed(&self, method: Method, path: &str, session: &str) -> Result<RequestBuilder, VsphereError> {
        Ok(self.request(method, path)?.header(SESSION_HEADER, session))
    }

    async fn send(request: RequestBuilder) -> Result<Response, VsphereError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(status_error(status, &message))
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, VsphereError> {
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|err| VsphereError::Rejected {
                message: format!("unreadable response: {err}"),
            })
    }
}

fn transport_error(err: reqwest::Error) -> VsphereError {
    if err.is_timeout() || err.is_connect() {
        VsphereError::Transient {
            message: err.to_string(),
        }
    } else {
        VsphereError::Rejected {
            message: err.to_string(),
        }
    }
}

pub(super) fn status_error(status: StatusCode, body: &str) -> VsphereError {
    let message = format!("{status}: {body}");
    if status == StatusCode::NOT_FOUND {
        VsphereError::NotFound { message }
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        VsphereError::Transient { message }
    } else {
        VsphereError::Rejected { message }
    }
}

impl VsphereApi for RestVsphereClient {
    fn create_session(&self) -> VsphereFuture<'_, String> {
        Box::pin(async move {
            let request = self
                .request(Method::POST, "api/session")?
                .header("Authorization", format!("Basic {}", self.auth_hash))
                .header("vmware-use-header-authn", "string");
            Self::json(request).await
        })
    }

    fn find_vm<'a>(&'a self, session: &'a str, name: &'a str) -> VsphereFuture<'a, Option<String>> {
        Box::pin(async move {
            let request = self.authed(Method::GET, "api/vcenter/vm", session)?;
            let vms: Vec<VmSummary> = Self::json(request).await?;
            Ok(vms.into_iter().find(|vm| vm.name == name).map(|vm| vm.vm))
        })
    }

    fn is_powered_on<'a>(&'a self, session: &'a str, vm: &'a str) -> VsphereFuture<'a, bool> {
        Box::pin(async move {
            let request = self.authed(Method::GET, &format!("api/vcenter/vm/{vm}/power"), session)?;
            let power: PowerInfo = Self::json(request).await?;
            Ok(power.state == POWERED_ON)
        })
    }

    fn clone_vm<'a>(
        &'a self,
        session: &'a str,
        source: &'a str,
        name: &'a str,
        instant: bool,
    ) -> VsphereFuture<'a, String> {
        Box::pin(async move {
            let action = if instant { "instant-clone" } else { "clone" };
            let request = self
                .authed(Method::POST, &format!("api/vcenter/vm?action={action}"), session)?
                .json(&json!({ "name": name, "source": source }));
            Self::json(request).await
        })
    }

    fn set_power<'a>(&'a self, session: &'a str, vm: &'a str, on: bool) -> VsphereFuture<'a, ()> {
        Box::pin(async move {
            let action = if on { "start" } else { "stop" };
            let request = self.authed(
                Method::POST,
                &format!("api/vcenter/vm/{vm}/power?action={action}"),
                session,
            )?;
            Self::send(request).await.map(drop)
        })
    }

    fn guest_ip<'a>(&'a self, session: &'a str, vm: &'a str) -> VsphereFuture<'a, Option<String>> {
        Box::pin(async move {
            let request = self.authed(
                Method::GET,
                &format!("api/vcenter/vm/{vm}/guest/identity"),
                session,
            )?;
            match Self::json::<GuestIdentity>(request).await {
                Ok(identity) => Ok(identity.ip_address.filter(|ip| !ip.is_empty())),
                Err(VsphereError::Rejected { message } | VsphereError::Transient { message })
                    if message.contains("error_type") =>
                {
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })
    }

    fn delete<'a>(&'a self, session: &'a str, vm: &'a str) -> VsphereFuture<'a, ()> {
        Box::pin(async move {
            let request = self.authed(Method::DELETE, &format!("api/vcenter/vm/{vm}"), session)?;
            Self::send(request).await.map(drop)
        })
    }
}
