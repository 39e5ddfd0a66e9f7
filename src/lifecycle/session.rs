//! Concurrent acquisition and release of the hosts of one run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::host_spec::HostSpec;
use crate::tunnel::TunnelLauncher;

use super::{Cancellation, HostHandle, HostOrchestrator, HostState, LifecycleError};

/// Hosts of one run, in insertion order, unique by label.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Vec<HostHandle>,
}

impl HostRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { hosts: Vec::new() }
    }

    /// Adds a host.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DuplicateLabel`] when the label is taken.
    pub fn insert(&mut self, host: HostHandle) -> Result<(), LifecycleError> {
        if self.contains(host.label()) {
            return Err(LifecycleError::DuplicateLabel {
                label: host.label().to_owned(),
            });
        }
        self.hosts.push(host);
        Ok(())
    }

    /// Returns `true` when a host is registered under `label`.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.get(label).is_some()
    }

    /// Host registered under `label`.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&HostHandle> {
        self.hosts.iter().find(|host| host.label() == label)
    }

    /// Mutable access to the host registered under `label`.
    #[must_use]
    pub fn get_mut(&mut self, label: &str) -> Option<&mut HostHandle> {
        self.hosts.iter_mut().find(|host| host.label() == label)
    }

    /// Labels in insertion order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.hosts.iter().map(HostHandle::label).collect()
    }

    /// Hosts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &HostHandle> {
        self.hosts.iter()
    }

    /// Number of registered hosts.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Returns `true` when no host is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn take_all(&mut self) -> Vec<HostHandle> {
        std::mem::take(&mut self.hosts)
    }
}

/// Result of one host task, tagged with the host's position.
type TaskResult = (usize, HostHandle, Result<(), LifecycleError>);

/// Collects task results back into registration order.
///
/// Host tasks catch their own panics, so a join failure only comes from the
/// runtime shutting down. A join error does not say which host it belonged
/// to; it is logged and every host without a result gets a generic error.
///
/// Returns the handles that came back and the errors in registration order.
async fn join_in_order(
    mut tasks: JoinSet<TaskResult>,
    labels: &[String],
) -> (Vec<HostHandle>, Vec<LifecycleError>) {
    let mut slots: Vec<Option<(HostHandle, Result<(), LifecycleError>)>> =
        labels.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, host, result)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some((host, result));
                }
            }
            Err(err) => warn!(error = %err, "host task did not complete"),
        }
    }

    let mut hosts = Vec::with_capacity(labels.len());
    let mut errors = Vec::new();
    for (slot, label) in slots.into_iter().zip(labels) {
        match slot {
            Some((host, result)) => {
                if let Err(err) = result {
                    errors.push(err);
                }
                hosts.push(host);
            }
            None => errors.push(LifecycleError::Task {
                label: label.clone(),
                message: String::from("task ended without a result"),
            }),
        }
    }
    (hosts, errors)
}

/// First error of a batch; the rest are logged.
fn first_error(errors: Vec<LifecycleError>) -> Result<(), LifecycleError> {
    let mut remaining = errors.into_iter();
    let Some(first) = remaining.next() else {
        return Ok(());
    };
    for other in remaining {
        warn!(error = %other, "additional host failure");
    }
    Err(first)
}

/// The hosts of one run and the orchestrator that acquires them.
///
/// Hosts are acquired and torn down concurrently, one task each, and stay
/// registered under their label until the session ends.
#[derive(Debug)]
pub struct Session<L> {
    orchestrator: Arc<HostOrchestrator<L>>,
    registry: HostRegistry,
    cancel: Cancellation,
}

impl<L: TunnelLauncher + 'static> Session<L> {
    /// Creates an empty session whose acquisitions observe `cancel`.
    #[must_use]
    pub const fn new(orchestrator: Arc<HostOrchestrator<L>>, cancel: Cancellation) -> Self {
        Self {
            orchestrator,
            registry: HostRegistry::new(),
            cancel,
        }
    }

    /// Registered hosts.
    #[must_use]
    pub const fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Host registered under `label`.
    #[must_use]
    pub fn host(&self, label: &str) -> Option<&HostHandle> {
        self.registry.get(label)
    }

    /// Acquires every host in `specs` concurrently and registers them in
    /// the given order, including hosts that failed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DuplicateLabel`] before anything is created
    /// when a label repeats or is already registered. Otherwise returns the
    /// first failure in `specs` order; every failed host has already been
    /// torn down by the orchestrator.
    pub async fn acquire_all(&mut self, specs: Vec<HostSpec>) -> Result<(), LifecycleError> {
        let mut labels: Vec<String> = Vec::with_capacity(specs.len());
        for spec in &specs {
            if self.registry.contains(&spec.label) || labels.contains(&spec.label) {
                return Err(LifecycleError::DuplicateLabel {
                    label: spec.label.clone(),
                });
            }
            labels.push(spec.label.clone());
        }

        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            prepared.push(self.orchestrator.prepare(spec)?);
        }

        let mut tasks = JoinSet::new();
        for (index, mut host) in prepared.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self.orchestrator);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let result = orchestrator.acquire(&mut host, &cancel).await;
                (index, host, result)
            });
        }

        let (hosts, errors) = join_in_order(tasks, &labels).await;
        for host in hosts {
            self.registry.insert(host)?;
        }
        let ready = self
            .registry
            .iter()
            .filter(|host| host.state() == HostState::Ready)
            .count();
        info!(ready, requested = labels.len(), "session hosts acquired");
        first_error(errors)
    }

    /// Tears down every registered host concurrently.
    ///
    /// Hosts already torn down are left alone, so calling this again only
    /// retries hosts whose teardown failed.
    ///
    /// # Errors
    ///
    /// Returns the first teardown failure in registration order.
    pub async fn teardown_all(&mut self) -> Result<(), LifecycleError> {
        let hosts = self.registry.take_all();
        let labels: Vec<String> = hosts.iter().map(|host| host.label().to_owned()).collect();

        let mut tasks = JoinSet::new();
        for (index, mut host) in hosts.into_iter().enumerate() {
            tasks.spawn(async move {
                let result = AssertUnwindSafe(host.teardown())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        host.state = HostState::Failed;
                        Err(host.panicked(payload.as_ref()))
                    });
                (index, host, result)
            });
        }

        let (returned, errors) = join_in_order(tasks, &labels).await;
        for host in returned {
            self.registry.insert(host)?;
        }
        info!(hosts = labels.len(), failures = errors.len(), "session torn down");
        first_error(errors)
    }
}
