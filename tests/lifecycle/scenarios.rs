//! BDD scenarios for host lifecycle orchestration.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Acquire and release a container host"
)]
fn scenario_acquire_and_release_container(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Lease lookup timeout still removes the clone"
)]
fn scenario_lease_timeout_removes_clone(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Transient clone failures are retried until creation succeeds"
)]
fn scenario_transient_clone_failures_retried(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Tearing down twice is the same as tearing down once"
)]
fn scenario_teardown_twice(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Teardown failure does not mask the original failure"
)]
fn scenario_teardown_failure_keeps_original(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
