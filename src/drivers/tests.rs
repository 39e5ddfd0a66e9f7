//! Tests for driver selection and the existing-host driver.

use std::sync::Arc;

use rstest::rstest;

use super::*;
use crate::backend::{AddressSource, HostAddress, InstanceHandle, ProvisionReuse};
use crate::config::HostProperties;
use crate::test_support::ScriptedRunner;

fn host(pairs: &[(&str, &str)]) -> HostSpec {
    let mut properties = HostProperties::new();
    for (key, value) in pairs {
        properties.set(*key, *value);
    }
    HostSpec::from_properties("web", &properties).unwrap_or_else(|err| panic!("resolve: {err}"))
}

fn factory(runner: &ScriptedRunner) -> DriverFactory {
    DriverFactory::new(OvercastConfig::default(), Arc::new(runner.clone()))
}

#[rstest]
#[case(&[("web.hostname", "ci.example.com")], BackendKind::Existing)]
#[case(
    &[("web.amiId", "ami-1"), ("web.amiInstanceType", "t3.micro"),
      ("web.amiSecurityGroup", "default"), ("web.amiKeyName", "ci")],
    BackendKind::CloudInstance
)]
#[case(&[("web.vagrantDir", "boxes/ubuntu"), ("web.vagrantIp", "192.168.33.10")], BackendKind::DesktopVm)]
#[case(
    &[("web.vboxUuid", "ci-box"), ("web.vboxBoxIp", "192.168.56.20"), ("web.vboxSnapshotUuid", "clean")],
    BackendKind::DesktopVm
)]
#[case(
    &[("web.baseDomain", "ubuntu"), ("web.ipLookupStrategy", "static"), ("web.static.ip", "10.0.0.2")],
    BackendKind::Hypervisor
)]
#[case(&[("web.dockerImage", "alpine")], BackendKind::Container)]
#[case(
    &[("web.vmBaseImage", "base"), ("web.vmwareApiHost", "vc.lab"), ("web.vmwareAuthHash", "abc")],
    BackendKind::EnterpriseHypervisor
)]
#[tokio::test]
async fn builds_the_driver_for_each_backend(
    #[case] pairs: &[(&str, &str)],
    #[case] expected: BackendKind,
) {
    let runner = ScriptedRunner::new();

    let driver = factory(&runner)
        .build(&host(pairs))
        .unwrap_or_else(|err| panic!("build: {err}"));

    assert_eq!(driver.kind(), expected);
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn unsupported_docker_endpoint_is_a_configuration_error() {
    let runner = ScriptedRunner::new();

    let result = factory(&runner).build(&host(&[("web.dockerHost", "ssh://docker.lab")]));

    assert!(matches!(result, Err(BackendError::Config(_))));
}

#[rstest]
#[tokio::test]
async fn unreachable_docker_engine_fails_creation_not_configuration() {
    let runner = ScriptedRunner::new();
    let driver = factory(&runner)
        .build(&host(&[("web.dockerHost", "unix:///nonexistent/overcast/docker.sock")]))
        .unwrap_or_else(|err| panic!("build: {err}"));

    let result = driver.create().await;

    assert!(matches!(result, Err(BackendError::Creation { .. })));
}

#[rstest]
#[tokio::test]
async fn existing_hosts_are_used_as_they_are() {
    let driver = ExistingDriver::new("ci.example.com");

    let handle = driver
        .create()
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    let address = driver
        .address(&handle)
        .await
        .unwrap_or_else(|err| panic!("address: {err}"));
    let destroyed = driver.destroy(&handle).await;

    assert_eq!(handle, InstanceHandle::new("ci.example.com"));
    assert_eq!(
        address,
        AddressSource::Resolved(HostAddress::new("ci.example.com"))
    );
    assert!(destroyed.is_ok());
    assert!(matches!(driver.provision_reuse(), ProvisionReuse::SameMachine));
}
