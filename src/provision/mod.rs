//! Provisioning of reachable hosts.
//!
//! The copy list and the provisioning command are retried together until
//! they succeed or the start timeout elapses. An expiration tag
//! fingerprints the provisioning inputs; whether a matching tag allows the
//! run to be skipped depends on what the host is. A host that is the same
//! machine on every run is checked against the [`TagStore`]
//! ([`ProvisioningEngine::provision`]). Hosts cloned from a provisioned
//! image carry the tag on the image and are handled by the lifecycle
//! orchestrator, which uses [`ProvisioningEngine::expiration_tag`] and
//! [`ProvisioningEngine::run`] directly.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::exec::{CommandRunner, ExecError, RemoteExecutor, RemoteTarget, local_shell};
use crate::host_spec::{ExpirationTag, ProvisionSpec};
use crate::wait::{PollPolicy, poll_until};

mod copy;
mod tag_store;

pub use copy::{CopyStep, copy_plan};
pub use tag_store::{FileTagStore, MemoryTagStore, TagStore};

const ATTEMPT_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while provisioning a host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The expiration tag command could not produce a tag.
    #[error("expiration tag command `{command}` failed: {message}")]
    ExpirationTag {
        /// Command that was run.
        command: String,
        /// Failure description.
        message: String,
    },
    /// Copy and command did not succeed within the start timeout.
    #[error("provisioning did not succeed within {}s: {last_error}", timeout.as_secs())]
    Timeout {
        /// Configured start timeout.
        timeout: Duration,
        /// Error from the last attempt.
        last_error: String,
    },
    /// A connection URL could not be parsed.
    #[error(transparent)]
    Target(#[from] ExecError),
    /// The tag store could not be read or written.
    #[error("tag store {path}: {message}")]
    TagStore {
        /// Backing file.
        path: Utf8PathBuf,
        /// Failure description.
        message: String,
    },
}

/// Result of a successful provisioning run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionOutcome {
    /// Copy and command ran; `tag` was recorded when configured.
    Provisioned {
        /// Expiration tag computed for this run.
        tag: Option<String>,
    },
    /// Nothing ran: the tag matched the last run on this same machine, or
    /// the host was cloned from an image provisioned under this tag.
    Cached {
        /// The matching tag.
        tag: String,
    },
}

impl ProvisionOutcome {
    /// Expiration tag associated with the run, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Provisioned { tag } => tag.as_deref(),
            Self::Cached { tag } => Some(tag),
        }
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("copying {source_path} to {destination}: {error}")]
    Copy {
        source_path: String,
        destination: String,
        error: ExecError,
    },
    #[error("provisioning command: {0}")]
    Command(ExecError),
}

/// Runs the provisioning protocol against hosts.
#[derive(Clone)]
pub struct ProvisioningEngine {
    executor: Arc<dyn RemoteExecutor>,
    local: Arc<dyn CommandRunner>,
    tags: Arc<dyn TagStore>,
    interval: Duration,
}

impl ProvisioningEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        local: Arc<dyn CommandRunner>,
        tags: Arc<dyn TagStore>,
    ) -> Self {
        Self {
            executor,
            local,
            tags,
            interval: ATTEMPT_INTERVAL,
        }
    }

    /// Overrides the pause between attempts.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Provisions a host that persists between runs.
    ///
    /// When the expiration tag matches the one recorded under `cache_key`
    /// after the last successful run, nothing is copied or executed.
    /// Otherwise the host is provisioned and the new tag recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ExpirationTag`] when the tag cannot be
    /// computed, [`ProvisionError::Timeout`] when the start timeout elapses,
    /// and [`ProvisionError::TagStore`] when the tag cannot be persisted.
    pub async fn provision(
        &self,
        cache_key: &str,
        host: &str,
        spec: &ProvisionSpec,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let tag = self.expiration_tag(spec).await?;

        let recorded = match &tag {
            Some(_) => self.tags.recorded(cache_key)?,
            None => None,
        };
        if let Some(current) = tag.as_ref().filter(|current| recorded.as_ref() == Some(*current)) {
            info!(cache_key, tag = %current, "expiration tag unchanged; skipping provisioning");
            return Ok(ProvisionOutcome::Cached {
                tag: current.clone(),
            });
        }

        self.run(host, spec).await?;
        if let Some(current) = &tag {
            self.tags.record(cache_key, current)?;
        }
        info!(host, cache_key, "provisioning finished");
        Ok(ProvisionOutcome::Provisioned { tag })
    }

    /// Computes the expiration tag, when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ExpirationTag`] when the command fails and
    /// [`ProvisionError::Target`] when its URL is malformed.
    pub async fn expiration_tag(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<Option<String>, ProvisionError> {
        match &spec.expiration_tag {
            Some(expiration) => self.compute_tag(expiration).await.map(Some),
            None => Ok(None),
        }
    }

    /// Copies the configured files and runs the provisioning command on
    /// `host`, retrying both as a unit until the start timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Timeout`] carrying the last attempt's error,
    /// or [`ProvisionError::Target`] when the connection URL is malformed.
    pub async fn run(&self, host: &str, spec: &ProvisionSpec) -> Result<(), ProvisionError> {
        let target = RemoteTarget::from_template(&spec.url, host)?;
        let plan = copy_plan(&spec.copy);
        let command = spec.command.replace("{0}", host);

        if !spec.boot_delay.is_zero() {
            debug!(host, delay = ?spec.boot_delay, "waiting before provisioning");
            sleep(spec.boot_delay).await;
        }

        let policy = PollPolicy::new(spec.start_timeout, self.interval);
        poll_until("provisioning", policy, |_| {
            self.attempt(&target, &plan, &command)
        })
        .await
        .map_err(|exhausted| ProvisionError::Timeout {
            timeout: spec.start_timeout,
            last_error: exhausted.describe_last(),
        })
    }

    async fn attempt(
        &self,
        target: &RemoteTarget,
        plan: &[CopyStep],
        command: &str,
    ) -> Result<Option<()>, AttemptError> {
        for step in plan {
            self.executor
                .copy(target, &step.source, &step.destination)
                .await
                .map_err(|error| AttemptError::Copy {
                    source_path: step.source.clone(),
                    destination: step.destination.clone(),
                    error,
                })?;
        }
        self.executor
            .execute(target, command)
            .await
            .and_then(|output| output.into_success("provisioning command"))
            .map_err(AttemptError::Command)?;
        Ok(Some(()))
    }

    async fn compute_tag(&self, expiration: &ExpirationTag) -> Result<String, ProvisionError> {
        let failed = |message: String| ProvisionError::ExpirationTag {
            command: expiration.command.clone(),
            message,
        };

        let output = match &expiration.url {
            Some(url) => {
                let target = RemoteTarget::parse(url)?;
                self.executor.execute(&target, &expiration.command).await
            }
            None => self.local.run(&local_shell(&expiration.command)).await,
        }
        .and_then(|output| output.into_success("expiration tag"))
        .map_err(|err| failed(err.to_string()))?;

        let tag = output.stdout.trim().to_owned();
        debug!(tag, "computed expiration tag");
        Ok(tag)
    }
}

impl std::fmt::Debug for ProvisioningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningEngine")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
