//! Test doubles for the lifecycle scenarios.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use overcast::drivers::docker::{
    ContainerApi, ContainerDetails, ContainerRequest, EngineError, EngineFuture,
};
use overcast::drivers::vmware::{VsphereApi, VsphereError, VsphereFuture};
use overcast::drivers::{DockerDriver, VmwareDriver};
use overcast::host_spec::BackendSpec;
use overcast::test_support::FakeBackend;
use overcast::{Backend, BackendError, BackendFactory, HostSpec};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ready<'a, T: Send + 'a, E: Send + 'a>(
    result: Result<T, E>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, E>> + Send + 'a>> {
    Box::pin(async move { result })
}

#[derive(Debug, Default)]
struct EngineState {
    containers: BTreeMap<String, bool>,
    commands: Vec<Vec<String>>,
    removals: usize,
}

/// Container engine keeping containers in memory.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn container_count(&self) -> usize {
        lock(&self.state).containers.len()
    }

    pub fn removals(&self) -> usize {
        lock(&self.state).removals
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.state).commands.clone()
    }

    fn missing(id: &str) -> EngineError {
        EngineError::NotFound {
            message: format!("no such container: {id}"),
        }
    }
}

impl ContainerApi for FakeEngine {
    fn image_present<'a>(&'a self, _image: &'a str) -> EngineFuture<'a, bool> {
        ready(Ok(true))
    }

    fn pull<'a>(&'a self, _image: &'a str) -> EngineFuture<'a, ()> {
        ready(Ok(()))
    }

    fn create<'a>(&'a self, request: &'a ContainerRequest) -> EngineFuture<'a, String> {
        let mut state = lock(&self.state);
        let id = format!("c{}", state.commands.len().saturating_add(1));
        state.commands.push(request.command.clone());
        state.containers.insert(id.clone(), false);
        ready(Ok(id))
    }

    fn start<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        let result = lock(&self.state)
            .containers
            .get_mut(id)
            .map(|running| *running = true)
            .ok_or_else(|| Self::missing(id));
        ready(result)
    }

    fn inspect<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ContainerDetails> {
        let result = lock(&self.state)
            .containers
            .get(id)
            .map(|running| ContainerDetails {
                id: id.to_owned(),
                running: *running,
                ip_address: Some(String::from("172.17.0.2")),
                published: Vec::new(),
            })
            .ok_or_else(|| Self::missing(id));
        ready(result)
    }

    fn kill<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        let result = match lock(&self.state).containers.get_mut(id) {
            Some(running) if *running => {
                *running = false;
                Ok(())
            }
            Some(_) => Err(EngineError::NotRunning),
            None => Err(Self::missing(id)),
        };
        ready(result)
    }

    fn remove<'a>(&'a self, id: &'a str, _volumes: bool) -> EngineFuture<'a, ()> {
        let mut state = lock(&self.state);
        let result = state
            .containers
            .remove(id)
            .map(drop)
            .ok_or_else(|| Self::missing(id));
        if result.is_ok() {
            state.removals = state.removals.saturating_add(1);
        }
        ready(result)
    }
}

#[derive(Debug, Default)]
struct VcenterState {
    transient_failures: usize,
    clone_attempts: usize,
    clones: Vec<String>,
}

/// vCenter that fails a configured number of clone calls transiently.
#[derive(Debug, Default)]
pub struct FakeVcenter {
    state: Mutex<VcenterState>,
}

impl FakeVcenter {
    pub fn fail_clones(&self, count: usize) {
        lock(&self.state).transient_failures = count;
    }

    pub fn clone_attempts(&self) -> usize {
        lock(&self.state).clone_attempts
    }
}

impl VsphereApi for FakeVcenter {
    fn create_session(&self) -> VsphereFuture<'_, String> {
        ready(Ok(String::from("session")))
    }

    fn find_vm<'a>(&'a self, _session: &'a str, name: &'a str) -> VsphereFuture<'a, Option<String>> {
        ready(Ok((name == "ubuntu-base").then(|| String::from("vm-1"))))
    }

    fn is_powered_on<'a>(&'a self, _session: &'a str, _vm: &'a str) -> VsphereFuture<'a, bool> {
        ready(Ok(true))
    }

    fn clone_vm<'a>(
        &'a self,
        _session: &'a str,
        _source: &'a str,
        _name: &'a str,
        _instant: bool,
    ) -> VsphereFuture<'a, String> {
        let mut state = lock(&self.state);
        state.clone_attempts = state.clone_attempts.saturating_add(1);
        if state.transient_failures > 0 {
            state.transient_failures = state.transient_failures.saturating_sub(1);
            return ready(Err(VsphereError::Transient {
                message: String::from("503 Service Unavailable"),
            }));
        }
        let id = format!("vm-{}", state.clones.len().saturating_add(101));
        state.clones.push(id.clone());
        ready(Ok(id))
    }

    fn set_power<'a>(&'a self, _session: &'a str, _vm: &'a str, _on: bool) -> VsphereFuture<'a, ()> {
        ready(Ok(()))
    }

    fn guest_ip<'a>(&'a self, _session: &'a str, _vm: &'a str) -> VsphereFuture<'a, Option<String>> {
        ready(Ok(Some(String::from("10.20.0.7"))))
    }

    fn delete<'a>(&'a self, _session: &'a str, vm: &'a str) -> VsphereFuture<'a, ()> {
        let mut state = lock(&self.state);
        let before = state.clones.len();
        state.clones.retain(|clone| clone != vm);
        let result = if state.clones.len() == before {
            Err(VsphereError::NotFound {
                message: format!("404 Not Found: {vm}"),
            })
        } else {
            Ok(())
        };
        ready(result)
    }
}

/// Builds real container and vSphere drivers over the fakes above, and
/// registered [`FakeBackend`]s for everything else.
#[derive(Clone, Debug, Default)]
pub struct ScenarioFactory {
    pub engine: Arc<FakeEngine>,
    pub vcenter: Arc<FakeVcenter>,
    fakes: Arc<Mutex<BTreeMap<String, FakeBackend>>>,
}

impl ScenarioFactory {
    pub fn register(&self, label: &str, backend: FakeBackend) {
        lock(&self.fakes).insert(label.to_owned(), backend);
    }
}

impl BackendFactory for ScenarioFactory {
    fn build(&self, spec: &HostSpec) -> Result<Arc<dyn Backend>, BackendError> {
        match &spec.backend {
            BackendSpec::Docker(docker) => {
                let engine: Arc<dyn ContainerApi> = self.engine.clone();
                Ok(Arc::new(DockerDriver::new(docker.clone(), engine)))
            }
            BackendSpec::Vmware(vmware) => {
                let vcenter: Arc<dyn VsphereApi> = self.vcenter.clone();
                Ok(Arc::new(VmwareDriver::new(vmware.clone(), vcenter)))
            }
            _ => lock(&self.fakes)
                .get(&spec.label)
                .cloned()
                .map(|backend| Arc::new(backend) as Arc<dyn Backend>)
                .ok_or_else(|| {
                    BackendError::creation(spec.kind(), format!("no backend for {}", spec.label))
                }),
        }
    }
}
