//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{
    AddressSource, Backend, BackendError, BackendFactory, BackendFuture, BackendKind,
    HostAddress, ImageCache, InstanceHandle, ProvisionReuse,
};
use crate::exec::{
    CommandLine, CommandOutput, CommandRunner, ExecError, ExecFuture, RemoteExecutor,
    RemoteTarget,
};
use crate::host_spec::HostSpec;
use crate::tunnel::{PortCheckFuture, TunnelError, TunnelLauncher, TunnelProcess, TunnelSpec};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Result<CommandOutput, ExecError>>>>,
    invocations: Arc<Mutex<Vec<CommandLine>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandLine> {
        lock(&self.invocations).clone()
    }

    /// Returns the rendered command strings recorded so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations().iter().map(CommandLine::display).collect()
    }

    /// Pushes a successful exit status with no output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(Ok(output(code, stdout, stderr)));
    }

    /// Pushes a spawn failure.
    pub fn push_spawn_error(&self, message: impl Into<String>) {
        lock(&self.responses).push_back(Err(ExecError::Spawn {
            program: String::from("scripted"),
            message: message.into(),
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, command: &'a CommandLine) -> ExecFuture<'a, CommandOutput> {
        lock(&self.invocations).push(command.clone());
        let next = lock(&self.responses).pop_front();
        Box::pin(async move {
            next.unwrap_or_else(|| {
                Err(ExecError::Spawn {
                    program: command.program().to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
        })
    }
}

/// A call recorded by [`ScriptedExecutor`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteCall {
    /// A command execution.
    Execute {
        /// Target host.
        host: String,
        /// Command text.
        command: String,
    },
    /// A file copy.
    Copy {
        /// Target host.
        host: String,
        /// Local source.
        source: String,
        /// Remote destination.
        destination: String,
    },
}

#[derive(Debug, Default)]
struct ExecutorScript {
    executions: VecDeque<Result<CommandOutput, ExecError>>,
    fallback: Option<Result<CommandOutput, ExecError>>,
    hangs: usize,
    copies: VecDeque<Result<(), ExecError>>,
    calls: Vec<RemoteCall>,
}

/// Scripted [`RemoteExecutor`].
///
/// Executions pop queued responses; once the queue is empty the fallback
/// response repeats forever. Queued hangs take precedence over both. Copies
/// succeed unless a failure is queued.
#[derive(Clone, Debug, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<ExecutorScript>>,
}

impl ScriptedExecutor {
    /// Creates an executor with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful execution with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        lock(&self.script)
            .executions
            .push_back(Ok(output(Some(0), stdout, "")));
    }

    /// Queues an execution result.
    pub fn push_output(&self, code: i32, stdout: impl Into<String>, stderr: impl Into<String>) {
        lock(&self.script)
            .executions
            .push_back(Ok(output(Some(code), stdout, stderr)));
    }

    /// Queues a connection failure.
    pub fn push_connection_error(&self) {
        lock(&self.script).executions.push_back(Err(connection_refused()));
    }

    /// Makes the next execution never complete.
    pub fn push_hang(&self) {
        let mut script = lock(&self.script);
        script.hangs = script.hangs.saturating_add(1);
    }

    /// Sets the response repeated once the queue is empty.
    pub fn set_fallback_stdout(&self, stdout: impl Into<String>) {
        lock(&self.script).fallback = Some(Ok(output(Some(0), stdout, "")));
    }

    /// Makes every unqueued execution fail with a connection error.
    pub fn set_fallback_connection_error(&self) {
        lock(&self.script).fallback = Some(Err(connection_refused()));
    }

    /// Queues a copy failure.
    pub fn push_copy_failure(&self) {
        lock(&self.script).copies.push_back(Err(ExecError::CommandFailure {
            program: String::from("scp"),
            status: Some(1),
            status_text: String::from("1"),
            stderr: String::from("lost connection"),
        }));
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.script).calls.clone()
    }

    /// Number of executions recorded.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, RemoteCall::Execute { .. }))
            .count()
    }
}

fn connection_refused() -> ExecError {
    ExecError::Connection {
        target: String::from("scripted"),
        message: String::from("connection refused"),
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn execute<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a str,
    ) -> ExecFuture<'a, CommandOutput> {
        let mut script = lock(&self.script);
        script.calls.push(RemoteCall::Execute {
            host: target.host.clone(),
            command: command.to_owned(),
        });
        if script.hangs > 0 {
            script.hangs = script.hangs.saturating_sub(1);
            drop(script);
            return Box::pin(std::future::pending());
        }
        let next = script.executions.pop_front().or_else(|| script.fallback.clone());
        drop(script);
        Box::pin(async move { next.unwrap_or_else(|| Err(connection_refused())) })
    }

    fn copy<'a>(
        &'a self,
        target: &'a RemoteTarget,
        source: &'a str,
        destination: &'a str,
    ) -> ExecFuture<'a, ()> {
        let mut script = lock(&self.script);
        script.calls.push(RemoteCall::Copy {
            host: target.host.clone(),
            source: source.to_owned(),
            destination: destination.to_owned(),
        });
        let next = script.copies.pop_front().unwrap_or(Ok(()));
        drop(script);
        Box::pin(async move { next })
    }
}

/// Tunnel launcher whose ports become reachable after a set number of
/// checks, or never.
#[derive(Clone, Debug, Default)]
pub struct FakeTunnelLauncher {
    ready_after: Option<usize>,
    early_exits: Arc<AtomicUsize>,
    port_checks: Arc<AtomicUsize>,
    launches: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl FakeTunnelLauncher {
    /// Ports accept connections from the `n`th check on.
    #[must_use]
    pub fn ready_after(checks: usize) -> Self {
        Self {
            ready_after: Some(checks),
            ..Self::default()
        }
    }

    /// Ports never accept connections.
    #[must_use]
    pub fn never_ready() -> Self {
        Self::default()
    }

    /// The first `count` launched processes report that they have already
    /// exited.
    #[must_use]
    pub fn with_early_exits(self, count: usize) -> Self {
        self.early_exits.store(count, Ordering::SeqCst);
        self
    }

    /// Number of tunnels launched.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of close calls made on launched tunnels.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of port checks made.
    #[must_use]
    pub fn port_checks(&self) -> usize {
        self.port_checks.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct FakeTunnelProcess {
    closes: Arc<AtomicUsize>,
    closed: bool,
    exited: bool,
}

impl TunnelProcess for FakeTunnelProcess {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }
}

impl TunnelLauncher for FakeTunnelLauncher {
    fn launch(
        &self,
        _target: &RemoteTarget,
        _spec: &TunnelSpec,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let exited = self
            .early_exits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        Ok(Box::new(FakeTunnelProcess {
            closes: Arc::clone(&self.closes),
            closed: false,
            exited,
        }))
    }

    fn check_port(&self, local_port: u16) -> PortCheckFuture<'_> {
        let made = self.port_checks.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let ready = self.ready_after.is_some_and(|needed| made >= needed);
        Box::pin(async move {
            if ready {
                Ok(())
            } else {
                Err(format!("connection refused on {local_port}"))
            }
        })
    }
}

/// What [`FakeBackend::destroy`] does.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DestroyBehaviour {
    /// Destroy succeeds the first time and reports "gone" afterwards.
    #[default]
    Succeed,
    /// Destroy always fails.
    Fail,
}

/// How [`FakeBackend`] carries provisioning between runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FakeReuse {
    /// Every instance is fresh.
    #[default]
    Never,
    /// Every run gets the same machine.
    SameMachine,
    /// Provisioned instances are kept as images.
    Images,
}

/// An image kept by [`FakeBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeImage {
    /// Image name.
    pub name: String,
    /// Cache key the image was stamped with.
    pub cache_key: String,
    /// Expiration tag the image was stamped with.
    pub tag: String,
}

#[derive(Debug)]
struct FakeState {
    create_failures: usize,
    reuse: FakeReuse,
    images: Vec<FakeImage>,
    cloned_from: Vec<String>,
    address: AddressSource,
    destroy: DestroyBehaviour,
    panic_on_address: bool,
    live: Vec<String>,
    create_calls: usize,
    destroy_calls: usize,
    next_id: usize,
}

/// In-memory backend recording calls and tracking live instances.
#[derive(Clone, Debug)]
pub struct FakeBackend {
    kind: BackendKind,
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    /// Creates a backend whose instances resolve to `host`.
    #[must_use]
    pub fn new(kind: BackendKind, host: &str) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(FakeState {
                create_failures: 0,
                reuse: FakeReuse::Never,
                images: Vec::new(),
                cloned_from: Vec::new(),
                address: AddressSource::Resolved(HostAddress::new(host)),
                destroy: DestroyBehaviour::Succeed,
                panic_on_address: false,
                live: Vec::new(),
                create_calls: 0,
                destroy_calls: 0,
                next_id: 0,
            })),
        }
    }

    /// Fails the next `count` create calls.
    pub fn fail_creates(&self, count: usize) {
        lock(&self.state).create_failures = count;
    }

    /// Reports the address as a lookup keyed by `key`.
    pub fn require_lookup(&self, key: &str) {
        lock(&self.state).address = AddressSource::Lookup {
            key: key.to_owned(),
        };
    }

    /// Sets how provisioning carries over between runs.
    pub fn set_reuse(&self, reuse: FakeReuse) {
        lock(&self.state).reuse = reuse;
    }

    /// Images currently kept.
    #[must_use]
    pub fn images(&self) -> Vec<FakeImage> {
        lock(&self.state).images.clone()
    }

    /// Image behind each instance created from an image, in order.
    #[must_use]
    pub fn cloned_from(&self) -> Vec<String> {
        lock(&self.state).cloned_from.clone()
    }

    /// Makes every address request panic, as a driver bug would.
    pub fn panic_on_address(&self) {
        lock(&self.state).panic_on_address = true;
    }

    /// Sets the destroy behaviour.
    pub fn set_destroy(&self, behaviour: DestroyBehaviour) {
        lock(&self.state).destroy = behaviour;
    }

    /// Number of create calls.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    /// Number of destroy calls.
    #[must_use]
    pub fn destroy_calls(&self) -> usize {
        lock(&self.state).destroy_calls
    }

    /// Identifiers of instances created and not yet destroyed.
    #[must_use]
    pub fn live_instances(&self) -> Vec<String> {
        lock(&self.state).live.clone()
    }
}

impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create(&self) -> BackendFuture<'_, InstanceHandle> {
        let result = {
            let mut state = lock(&self.state);
            state.create_calls = state.create_calls.saturating_add(1);
            if state.create_failures > 0 {
                state.create_failures = state.create_failures.saturating_sub(1);
                Err(BackendError::creation(self.kind, "quota exceeded"))
            } else {
                state.next_id = state.next_id.saturating_add(1);
                let id = format!("fake-{}", state.next_id);
                state.live.push(id.clone());
                Ok(InstanceHandle::new(id))
            }
        };
        Box::pin(async move { result })
    }

    fn address<'a>(&'a self, _handle: &'a InstanceHandle) -> BackendFuture<'a, AddressSource> {
        let (address, panics) = {
            let state = lock(&self.state);
            (state.address.clone(), state.panic_on_address)
        };
        Box::pin(async move {
            assert!(!panics, "address lookup blew up");
            Ok(address)
        })
    }

    fn destroy<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, ()> {
        let result = {
            let mut state = lock(&self.state);
            state.destroy_calls = state.destroy_calls.saturating_add(1);
            match state.destroy {
                DestroyBehaviour::Fail => {
                    Err(BackendError::destroy(self.kind, &handle.id, "backend unavailable"))
                }
                DestroyBehaviour::Succeed => {
                    let before = state.live.len();
                    state.live.retain(|id| id != &handle.id);
                    if state.live.len() == before {
                        Err(BackendError::Gone {
                            kind: self.kind,
                            id: handle.id.clone(),
                        })
                    } else {
                        Ok(())
                    }
                }
            }
        };
        Box::pin(async move { result })
    }

    fn provision_reuse(&self) -> ProvisionReuse<'_> {
        match lock(&self.state).reuse {
            FakeReuse::Never => ProvisionReuse::Never,
            FakeReuse::SameMachine => ProvisionReuse::SameMachine,
            FakeReuse::Images => ProvisionReuse::Images(self),
        }
    }
}

impl ImageCache for FakeBackend {
    fn find<'a>(&'a self, cache_key: &'a str, tag: &'a str) -> BackendFuture<'a, Option<String>> {
        let found = {
            let mut state = lock(&self.state);
            state
                .images
                .retain(|image| image.cache_key != cache_key || image.tag == tag);
            state
                .images
                .iter()
                .find(|image| image.cache_key == cache_key)
                .map(|image| image.name.clone())
        };
        Box::pin(async move { Ok(found) })
    }

    fn capture<'a>(
        &'a self,
        instance: &'a InstanceHandle,
        cache_key: &'a str,
        tag: &'a str,
    ) -> BackendFuture<'a, String> {
        let result = {
            let mut state = lock(&self.state);
            let before = state.live.len();
            state.live.retain(|id| id != &instance.id);
            if state.live.len() == before {
                Err(BackendError::creation(self.kind, format!("{} is gone", instance.id)))
            } else {
                let name = format!("image-{}", instance.id);
                state.images.push(FakeImage {
                    name: name.clone(),
                    cache_key: cache_key.to_owned(),
                    tag: tag.to_owned(),
                });
                Ok(name)
            }
        };
        Box::pin(async move { result })
    }

    fn create_from<'a>(&'a self, image: &'a str) -> BackendFuture<'a, InstanceHandle> {
        let result = {
            let mut state = lock(&self.state);
            if state.images.iter().any(|kept| kept.name == image) {
                state.next_id = state.next_id.saturating_add(1);
                let id = format!("fake-{}", state.next_id);
                state.live.push(id.clone());
                state.cloned_from.push(image.to_owned());
                Ok(InstanceHandle::new(id))
            } else {
                Err(BackendError::creation(self.kind, format!("no image {image}")))
            }
        };
        Box::pin(async move { result })
    }
}

/// Factory handing out pre-registered fake backends by host label.
#[derive(Clone, Debug, Default)]
pub struct FakeBackendFactory {
    backends: Arc<Mutex<BTreeMap<String, FakeBackend>>>,
}

impl FakeBackendFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the backend used for `label`.
    pub fn register(&self, label: &str, backend: FakeBackend) {
        lock(&self.backends).insert(label.to_owned(), backend);
    }
}

impl BackendFactory for FakeBackendFactory {
    fn build(&self, spec: &HostSpec) -> Result<Arc<dyn Backend>, BackendError> {
        lock(&self.backends)
            .get(&spec.label)
            .cloned()
            .map(|backend| Arc::new(backend) as Arc<dyn Backend>)
            .ok_or_else(|| {
                BackendError::creation(spec.kind(), format!("no fake backend for {}", spec.label))
            })
    }
}
