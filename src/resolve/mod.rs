//! Address resolution for hosts whose address is assigned asynchronously.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::exec::{ExecError, RemoteExecutor, RemoteTarget};
use crate::host_spec::IpLookupStrategy;
use crate::wait::{PollPolicy, poll_until};

const LOOKUP_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while resolving an address.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// No lease appeared within the lookup timeout.
    #[error("no address for {key} after {}s: {last_error}", timeout.as_secs())]
    Timeout {
        /// Identifier that was looked up.
        key: String,
        /// Configured lookup timeout.
        timeout: Duration,
        /// Last lookup failure, or a note that every lookup came back empty.
        last_error: String,
    },
    /// The DHCP authority URL is unusable.
    #[error(transparent)]
    Target(#[from] ExecError),
}

#[derive(Debug, Error)]
enum LookupAttemptError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("lookup command reported: {0}")]
    Stderr(String),
}

/// Resolves addresses according to a host's [`IpLookupStrategy`].
#[derive(Clone)]
pub struct AddressResolver {
    executor: Arc<dyn RemoteExecutor>,
    interval: Duration,
}

impl AddressResolver {
    /// Creates a resolver that runs lookups through `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            interval: LOOKUP_INTERVAL,
        }
    }

    /// Overrides the pause between lookups.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Resolves the address of the instance identified by `key`.
    ///
    /// The static strategy returns immediately without any remote call. The
    /// lease lookup strategy polls the DHCP authority, absorbing connection
    /// errors and empty answers, until it reports an address or the timeout
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Timeout`] when the timeout elapses first, or
    /// [`ResolveError::Target`] when the authority URL cannot be parsed.
    pub async fn resolve(
        &self,
        strategy: &IpLookupStrategy,
        key: &str,
    ) -> Result<String, ResolveError> {
        match strategy {
            IpLookupStrategy::Static { ip } => {
                debug!(key, ip, "using static address");
                Ok(ip.clone())
            }
            IpLookupStrategy::LeaseLookup {
                url,
                command,
                timeout,
            } => {
                let target = RemoteTarget::parse(url)?;
                let lookup = command.replace("{0}", key);
                let policy = PollPolicy::new(*timeout, self.interval);
                let address = poll_until("lease lookup", policy, |_| {
                    self.lookup_once(&target, &lookup)
                })
                .await
                .map_err(|exhausted| ResolveError::Timeout {
                    key: key.to_owned(),
                    timeout: *timeout,
                    last_error: exhausted.describe_last(),
                })?;
                info!(key, address, "resolved address from lease");
                Ok(address)
            }
        }
    }

    async fn lookup_once(
        &self,
        target: &RemoteTarget,
        command: &str,
    ) -> Result<Option<String>, LookupAttemptError> {
        let output = self.executor.execute(target, command).await?;
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            return Err(LookupAttemptError::Stderr(stderr.to_owned()));
        }
        Ok(output.first_line().map(ToOwned::to_owned))
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
