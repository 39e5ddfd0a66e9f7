//! Shared fixtures for lifecycle BDD scenarios.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use overcast::provision::{MemoryTagStore, ProvisioningEngine};
use overcast::resolve::AddressResolver;
use overcast::test_support::{FakeBackend, FakeTunnelLauncher, ScriptedExecutor, ScriptedRunner};
use overcast::tunnel::TunnelManager;
use overcast::{
    Cancellation, ErrorKind, HostOrchestrator, HostProperties, HostSpec, LifecycleError, Session,
};
use rstest::fixture;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

use super::test_doubles::ScenarioFactory;

pub type ScenarioSession = Session<FakeTunnelLauncher>;

#[derive(Clone, Debug)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&LifecycleError> for Failure {
    fn from(err: &LifecycleError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub factory: ScenarioFactory,
    pub executor: ScriptedExecutor,
    pub properties: HostProperties,
    pub labels: Vec<String>,
    pub clones: Option<FakeBackend>,
    pub session: Arc<Mutex<ScenarioSession>>,
    pub runtime: Arc<Runtime>,
    pub outcome: Option<Result<(), Failure>>,
}

#[derive(Debug, Error)]
pub enum LifecycleTestError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl LifecycleContext {
    pub fn session(&self) -> MutexGuard<'_, ScenarioSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn specs(&self) -> Vec<HostSpec> {
        self.labels
            .iter()
            .map(|label| {
                HostSpec::from_properties(label, &self.properties)
                    .unwrap_or_else(|err| panic!("host {label} should be valid: {err}"))
            })
            .collect()
    }
}

#[fixture]
pub fn lifecycle_context_result() -> Result<LifecycleContext, LifecycleTestError> {
    build_lifecycle_context()
}

#[fixture]
pub fn lifecycle_context(
    lifecycle_context_result: Result<LifecycleContext, LifecycleTestError>,
) -> LifecycleContext {
    lifecycle_context_result
        .unwrap_or_else(|err| panic!("lifecycle context fixture should initialise: {err}"))
}

pub fn build_lifecycle_context() -> Result<LifecycleContext, LifecycleTestError> {
    let runtime = Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()?;
    let factory = ScenarioFactory::default();
    let executor = ScriptedExecutor::new();
    let orchestrator = HostOrchestrator::new(
        Arc::new(factory.clone()),
        AddressResolver::new(Arc::new(executor.clone())),
        TunnelManager::new(FakeTunnelLauncher::ready_after(1)),
        ProvisioningEngine::new(
            Arc::new(executor.clone()),
            Arc::new(ScriptedRunner::new()),
            Arc::new(MemoryTagStore::new()),
        ),
    );

    Ok(LifecycleContext {
        factory,
        executor,
        properties: HostProperties::new(),
        labels: Vec::new(),
        clones: None,
        session: Arc::new(Mutex::new(Session::new(
            Arc::new(orchestrator),
            Cancellation::never(),
        ))),
        runtime: Arc::new(runtime),
        outcome: None,
    })
}
