//! BDD scenarios for idempotent controller RPCs.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ControllerWorld, world};

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "Repeated create returns the same volume"
)]
fn scenario_repeated_create(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "Concurrent creates share one provider call"
)]
fn scenario_concurrent_create(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "Deleting twice succeeds"
)]
fn scenario_delete_twice(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "Publishing to the attached node is a no-op"
)]
fn scenario_publish_no_op(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "Publishing to a second node is refused"
)]
fn scenario_publish_conflict(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "Transient failures are retried until success"
)]
fn scenario_transient_retry(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "A short deadline aborts the retry loop"
)]
fn scenario_deadline_abort(world: ControllerWorld) {
    drop(world);
}

#[scenario(
    path = "tests/features/idempotency.feature",
    name = "A publish abandoned at its deadline still completes"
)]
fn scenario_abandoned_publish_completes(world: ControllerWorld) {
    drop(world);
}
