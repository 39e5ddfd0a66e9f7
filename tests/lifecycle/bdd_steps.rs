//! BDD step definitions for host acquisition and teardown.

use overcast::BackendKind;
use overcast::test_support::{DestroyBehaviour, FakeBackend};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{Failure, LifecycleContext, LifecycleTestError};

const LEASE_MAC: &str = "52:54:00:12:34:56";

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] LifecycleTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a container host \"{label}\" from image \"{image}\"")]
fn container_host(
    mut lifecycle_context: LifecycleContext,
    label: String,
    image: String,
) -> LifecycleContext {
    let properties = &mut lifecycle_context.properties;
    properties.set(format!("{label}.dockerImage"), image);
    properties.set(format!("{label}.remove"), "true");
    properties.set_list(format!("{label}.command"), ["/bin/sh", "-c", "sleep 5"]);
    lifecycle_context.labels.push(label);
    lifecycle_context
}

#[given("a hypervisor clone \"{label}\" whose lease never appears within \"{seconds}\" seconds")]
fn hypervisor_clone(
    mut lifecycle_context: LifecycleContext,
    label: String,
    seconds: u64,
) -> LifecycleContext {
    let properties = &mut lifecycle_context.properties;
    properties.set(format!("{label}.baseDomain"), "ubuntu-base");
    properties.set(format!("{label}.SSH.url"), "ssh://root@dhcp.lab");
    properties.set(
        format!("{label}.SSH.command"),
        "grep -i {0} /var/lib/misc/dnsmasq.leases | cut -d' ' -f3",
    );
    properties.set(format!("{label}.SSH.timeout"), seconds.to_string());

    let clones = FakeBackend::new(BackendKind::Hypervisor, "unused");
    clones.require_lookup(LEASE_MAC);
    lifecycle_context.factory.register(&label, clones.clone());
    lifecycle_context.executor.set_fallback_stdout("");
    lifecycle_context.clones = Some(clones);
    lifecycle_context.labels.push(label);
    lifecycle_context
}

#[given("hypervisor teardown fails")]
fn hypervisor_teardown_fails(lifecycle_context: LifecycleContext) -> LifecycleContext {
    if let Some(clones) = &lifecycle_context.clones {
        clones.set_destroy(DestroyBehaviour::Fail);
    }
    lifecycle_context
}

#[given("a vSphere clone \"{label}\" allowing \"{retries}\" retries")]
fn vsphere_clone(
    mut lifecycle_context: LifecycleContext,
    label: String,
    retries: u64,
) -> LifecycleContext {
    let properties = &mut lifecycle_context.properties;
    properties.set(format!("{label}.vmBaseImage"), "ubuntu-base");
    properties.set(format!("{label}.vmwareApiHost"), "vcenter.lab");
    properties.set(format!("{label}.vmwareAuthHash"), "dXNlcjpwYXNz");
    properties.set(format!("{label}.maxRetries"), retries.to_string());
    lifecycle_context.labels.push(label);
    lifecycle_context
}

#[given("the first \"{count}\" vSphere clone attempts fail transiently")]
fn vsphere_transient_failures(lifecycle_context: LifecycleContext, count: usize) -> LifecycleContext {
    lifecycle_context.factory.vcenter.fail_clones(count);
    lifecycle_context
}

#[when("I acquire the hosts")]
fn acquire_hosts(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    let specs = lifecycle_context.specs();
    let result = {
        let mut session = lifecycle_context.session();
        lifecycle_context
            .runtime
            .block_on(session.acquire_all(specs))
    };
    lifecycle_context.outcome = Some(result.map_err(|err| Failure::from(&err)));
    lifecycle_context
}

#[when("I tear down the session")]
fn tear_down_session(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let result = {
        let mut session = lifecycle_context.session();
        lifecycle_context.runtime.block_on(session.teardown_all())
    };
    result.map_err(|err| StepError::Assertion(format!("teardown failed: {err}")))?;
    Ok(lifecycle_context)
}

fn failure(lifecycle_context: &LifecycleContext) -> Result<&Failure, StepError> {
    match &lifecycle_context.outcome {
        Some(Err(failure)) => Ok(failure),
        Some(Ok(())) => Err(StepError::Assertion(String::from(
            "expected acquisition to fail",
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("acquisition succeeds")]
fn acquisition_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(Ok(())) => Ok(()),
        Some(Err(failure)) => Err(StepError::Assertion(format!(
            "expected success, got {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("acquisition fails with \"{kind}\"")]
fn acquisition_fails_with(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    let actual = failure(lifecycle_context)?;
    if format!("{:?}", actual.kind) == kind {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {kind}, got {:?}: {}",
            actual.kind, actual.message
        )))
    }
}

#[then("the failure mentions \"{text}\"")]
fn failure_mentions(lifecycle_context: &LifecycleContext, text: String) -> Result<(), StepError> {
    let actual = failure(lifecycle_context)?;
    if actual.message.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure to mention {text:?}, got {:?}",
            actual.message
        )))
    }
}

#[then("host \"{label}\" is \"{state}\"")]
fn host_state(lifecycle_context: &LifecycleContext, label: String, state: String) -> Result<(), StepError> {
    let session = lifecycle_context.session();
    let host = session
        .host(&label)
        .ok_or_else(|| StepError::Assertion(format!("host {label} is not registered")))?;
    let actual = host.state().to_string();
    if actual == state {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected host {label} to be {state}, got {actual}"
        )))
    }
}

#[then("host \"{label}\" has address \"{address}\"")]
fn host_address(
    lifecycle_context: &LifecycleContext,
    label: String,
    address: String,
) -> Result<(), StepError> {
    let session = lifecycle_context.session();
    let actual = session
        .host(&label)
        .and_then(|host| host.address())
        .map(|resolved| resolved.host.clone());
    if actual.as_deref() == Some(address.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected host {label} at {address}, got {actual:?}"
        )))
    }
}

#[then("the container runs \"{command}\"")]
fn container_runs(lifecycle_context: &LifecycleContext, command: String) -> Result<(), StepError> {
    let commands = lifecycle_context.factory.engine.commands();
    if commands.iter().any(|recorded| recorded.join(" ") == command) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a container running {command:?}, got {commands:?}"
        )))
    }
}

#[then("the container engine holds no containers")]
fn engine_empty(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let count = lifecycle_context.factory.engine.container_count();
    if count == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no containers, found {count}"
        )))
    }
}

#[then("the container engine removed \"{count}\" containers")]
fn engine_removals(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let actual = lifecycle_context.factory.engine.removals();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} removals, got {actual}"
        )))
    }
}

#[then("no hypervisor clones are left")]
fn no_clones_left(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let clones = lifecycle_context
        .clones
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("no hypervisor backend configured")))?;
    let live = clones.live_instances();
    if live.is_empty() && clones.destroy_calls() > 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected the clone to be destroyed, still live: {live:?}"
        )))
    }
}

#[then("vSphere saw \"{count}\" clone attempts")]
fn vsphere_clone_attempts(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let actual = lifecycle_context.factory.vcenter.clone_attempts();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} clone attempts, got {actual}"
        )))
    }
}
