//! Tests for the vSphere driver.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use reqwest::StatusCode;
use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::client::{api_base, status_error};
use super::*;
use crate::host_spec::TlsPolicy;

const BASE: &str = "ubuntu-base";
const SESSION: &str = "session-1";

#[derive(Debug)]
struct Vm {
    name: String,
    powered_on: bool,
}

#[derive(Debug, Default)]
struct VcenterState {
    vms: BTreeMap<String, Vm>,
    transient_clone_failures: usize,
    missing_ip_reports: usize,
    calls: Vec<String>,
    next_id: usize,
}

/// In-memory vCenter with scripted transient failures.
#[derive(Debug, Default)]
struct FakeVcenter {
    state: Mutex<VcenterState>,
}

impl FakeVcenter {
    fn with_base(powered_on: bool) -> Self {
        let vcenter = Self::default();
        vcenter.state().vms.insert(
            String::from("vm-1"),
            Vm {
                name: String::from(BASE),
                powered_on,
            },
        );
        vcenter
    }

    fn state(&self) -> MutexGuard<'_, VcenterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn not_found(vm: &str) -> VsphereError {
        VsphereError::NotFound {
            message: format!("404 Not Found: {vm}"),
        }
    }
}

fn ready<'a, T: Send + 'a>(result: Result<T, VsphereError>) -> VsphereFuture<'a, T> {
    Box::pin(async move { result })
}

impl VsphereApi for FakeVcenter {
    fn create_session(&self) -> VsphereFuture<'_, String> {
        self.state().calls.push(String::from("session"));
        ready(Ok(String::from(SESSION)))
    }

    fn find_vm<'a>(&'a self, session: &'a str, name: &'a str) -> VsphereFuture<'a, Option<String>> {
        let mut state = self.state();
        state.calls.push(format!("find {name} with {session}"));
        let found = state
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(id, _)| id.clone());
        ready(Ok(found))
    }

    fn is_powered_on<'a>(&'a self, _session: &'a str, vm: &'a str) -> VsphereFuture<'a, bool> {
        let mut state = self.state();
        state.calls.push(format!("power state {vm}"));
        let result = state
            .vms
            .get(vm)
            .map(|found| found.powered_on)
            .ok_or_else(|| Self::not_found(vm));
        ready(result)
    }

    fn clone_vm<'a>(
        &'a self,
        _session: &'a str,
        source: &'a str,
        name: &'a str,
        instant: bool,
    ) -> VsphereFuture<'a, String> {
        let mut state = self.state();
        state.calls.push(format!("clone {source} instant={instant}"));
        if state.transient_clone_failures > 0 {
            state.transient_clone_failures -= 1;
            return ready(Err(VsphereError::Transient {
                message: String::from("503 Service Unavailable"),
            }));
        }
        state.next_id += 1;
        let id = format!("vm-{}", state.next_id + 100);
        state.vms.insert(
            id.clone(),
            Vm {
                name: name.to_owned(),
                powered_on: instant,
            },
        );
        ready(Ok(id))
    }

    fn set_power<'a>(&'a self, _session: &'a str, vm: &'a str, on: bool) -> VsphereFuture<'a, ()> {
        let mut state = self.state();
        state.calls.push(format!("set power {vm} on={on}"));
        let result = state
            .vms
            .get_mut(vm)
            .map(|found| found.powered_on = on)
            .ok_or_else(|| Self::not_found(vm));
        ready(result)
    }

    fn guest_ip<'a>(&'a self, _session: &'a str, vm: &'a str) -> VsphereFuture<'a, Option<String>> {
        let mut state = self.state();
        state.calls.push(format!("identity {vm}"));
        if state.missing_ip_reports > 0 {
            state.missing_ip_reports -= 1;
            return ready(Ok(None));
        }
        ready(Ok(Some(String::from("10.20.0.7"))))
    }

    fn delete<'a>(&'a self, _session: &'a str, vm: &'a str) -> VsphereFuture<'a, ()> {
        let mut state = self.state();
        state.calls.push(format!("delete {vm}"));
        let result = state
            .vms
            .remove(vm)
            .map(drop)
            .ok_or_else(|| Self::not_found(vm));
        ready(result)
    }
}

fn spec(instance_clone: bool, max_retries: usize) -> VmwareSpec {
    VmwareSpec {
        api_host: String::from("vcenter.lab"),
        auth_hash: String::from("dXNlcjpwYXNz"),
        base_image: String::from(BASE),
        instance_clone,
        max_retries,
        start_timeout: Duration::from_secs(180),
        ignore_bad_certificate: false,
        security_algorithm: TlsPolicy::Default,
    }
}

#[fixture]
fn vcenter() -> Arc<FakeVcenter> {
    Arc::new(FakeVcenter::with_base(true))
}

fn driver(vcenter: &Arc<FakeVcenter>, spec: VmwareSpec) -> VmwareDriver {
    let api: Arc<dyn VsphereApi> = vcenter.clone();
    VmwareDriver::new(spec, api)
}

#[test]
fn clone_names_carry_a_short_random_suffix() {
    let name = clone_name(BASE);

    let suffix = name.strip_prefix("ubuntu-base-").unwrap_or_default();
    assert_eq!(suffix.len(), 8, "unexpected name {name}");
    assert!(suffix.chars().all(|ch| ch.is_ascii_alphanumeric()));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transient_clone_failures_are_retried_until_success(vcenter: Arc<FakeVcenter>) {
    vcenter.state().transient_clone_failures = 2;
    let driver = driver(&vcenter, spec(true, 3));
    let started = Instant::now();

    let handle = driver
        .create()
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(handle.id, "vm-101");
    assert_eq!(vcenter.count("clone "), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn retries_stop_after_the_configured_maximum(vcenter: Arc<FakeVcenter>) {
    vcenter.state().transient_clone_failures = 10;
    let driver = driver(&vcenter, spec(true, 3));
    let started = Instant::now();

    let result = driver.create().await;

    assert!(matches!(result, Err(BackendError::Creation { .. })));
    assert_eq!(vcenter.count("clone "), 4);
    assert_eq!(started.elapsed(), Duration::from_secs(15));
}

#[rstest]
#[tokio::test]
async fn instant_clone_of_a_powered_off_source_is_rejected() {
    let vcenter = Arc::new(FakeVcenter::with_base(false));

    let result = driver(&vcenter, spec(true, 15)).create().await;

    let Err(BackendError::Creation { message, .. }) = result else {
        panic!("expected a creation error, got {result:?}");
    };
    assert!(message.contains("powered on"), "got {message}");
    assert_eq!(vcenter.count("clone "), 0);
}

#[rstest]
#[tokio::test]
async fn full_clone_is_powered_on_after_cloning() {
    let vcenter = Arc::new(FakeVcenter::with_base(false));

    let handle = driver(&vcenter, spec(false, 15))
        .create()
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(
        vcenter.calls(),
        vec![
            String::from("session"),
            format!("find {BASE} with {SESSION}"),
            String::from("clone vm-1 instant=false"),
            format!("set power {} on=true", handle.id),
        ]
    );
    assert!(
        handle
            .metadata
            .get("name")
            .is_some_and(|name| name.starts_with("ubuntu-base-"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn address_waits_for_the_guest_to_report_an_ip(vcenter: Arc<FakeVcenter>) {
    vcenter.state().missing_ip_reports = 2;

    let address = driver(&vcenter, spec(true, 15))
        .address(&InstanceHandle::new("vm-1"))
        .await
        .unwrap_or_else(|err| panic!("address: {err}"));

    assert_eq!(address, AddressSource::Resolved(HostAddress::new("10.20.0.7")));
    assert_eq!(vcenter.count("identity "), 3);
}

#[rstest]
#[tokio::test]
async fn teardown_powers_off_and_deletes(vcenter: Arc<FakeVcenter>) {
    let driver = driver(&vcenter, spec(true, 15));
    let handle = driver
        .create()
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    driver
        .destroy(&handle)
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    let calls = vcenter.calls();
    let tail: Vec<&str> = calls.iter().rev().take(2).map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            format!("delete {}", handle.id).as_str(),
            format!("set power {} on=false", handle.id).as_str(),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn teardown_of_a_deleted_clone_is_gone(vcenter: Arc<FakeVcenter>) {
    let result = driver(&vcenter, spec(true, 15))
        .destroy(&InstanceHandle::new("vm-404"))
        .await;

    assert!(result.is_err_and(|err| err.is_gone()));
}

#[rstest]
#[case("vcenter.lab", "https://vcenter.lab/")]
#[case("vcenter.lab:8443", "https://vcenter.lab:8443/")]
#[case("http://vcenter.lab/", "http://vcenter.lab/")]
#[case("https://vcenter.lab/rest", "https://vcenter.lab/rest/")]
fn normalizes_the_api_host(#[case] host: &str, #[case] expected: &str) {
    let base = api_base(host).unwrap_or_else(|err| panic!("{host}: {err}"));
    assert_eq!(base.as_str(), expected);
}

#[rstest]
#[case(StatusCode::NOT_FOUND, "not found")]
#[case(StatusCode::SERVICE_UNAVAILABLE, "transient")]
#[case(StatusCode::UNAUTHORIZED, "rejected")]
fn classifies_status_codes(#[case] status: StatusCode, #[case] expected: &str) {
    let classified = match status_error(status, "") {
        VsphereError::NotFound { .. } => "not found",
        VsphereError::Transient { .. } => "transient",
        VsphereError::Rejected { .. } => "rejected",
    };
    assert_eq!(classified, expected);
}

#[rstest]
#[case(TlsPolicy::Default)]
#[case(TlsPolicy::Tls12)]
#[case(TlsPolicy::Tls13)]
fn builds_clients_for_every_tls_policy(#[case] policy: TlsPolicy) {
    let tls = VmwareSpec {
        ignore_bad_certificate: true,
        security_algorithm: policy,
        ..spec(true, 3)
    };

    assert!(RestVsphereClient::new(&tls).is_ok());
}
