//! BDD step definitions for idempotent controller RPCs.

use std::time::Duration;

use hcloud_csi::csi::controller_server::Controller;
use hcloud_csi::csi::volume_capability::access_mode::Mode;
use hcloud_csi::csi::volume_capability::{AccessMode, AccessType, MountVolume};
use hcloud_csi::csi::{
    ControllerPublishVolumeRequest, CreateVolumeRequest, DeleteVolumeRequest, VolumeCapability,
};
use hcloud_csi::test_support::Call;
use hcloud_csi::volume::GIB;
use hcloud_csi::{Volume, VolumeError, VolumeState};
use rstest_bdd_macros::{given, then, when};
use tonic::{Request, Status};

use super::test_helpers::{ControllerWorld, LOCATION, Outcome, RUNTIME};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid step argument: {0}")]
    Argument(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn writer_capability() -> VolumeCapability {
    VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume::default())),
        access_mode: Some(AccessMode {
            mode: i32::from(Mode::SingleNodeWriter),
        }),
    }
}

fn create_request(name: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_owned(),
        volume_capabilities: vec![writer_capability()],
        ..CreateVolumeRequest::default()
    }
}

fn publish_request(volume_id: &str, node: &str) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.to_owned(),
        node_id: node.to_owned(),
        volume_capability: Some(writer_capability()),
        ..ControllerPublishVolumeRequest::default()
    }
}

fn unit_outcome<T>(result: Result<T, Status>) -> Outcome {
    result.map(|_| None).map_err(|status| status.code())
}

fn parse_node(node: &str) -> Result<u64, StepError> {
    node.parse()
        .map_err(|_| StepError::Argument(format!("node `{node}` is not numeric")))
}

#[given("a controller over an empty provider")]
fn empty_provider(world: &ControllerWorld) {
    assert!(world.provider.volumes().is_empty());
}

#[given("a controller over a provider holding volume \"{name}\"")]
fn provider_with_volume(world: &ControllerWorld, name: String) {
    let id = world.provider.seed(&name, 10, LOCATION);
    world.volume_id.replace(Some(id.to_string()));
}

#[given("the volume is attached to node \"{node}\"")]
fn volume_attached(world: &ControllerWorld, node: String) -> Result<(), StepError> {
    let server = parse_node(&node)?;
    let id: u64 = world
        .volume_id()
        .parse()
        .map_err(|_| StepError::Argument(String::from("seeded id is not numeric")))?;
    let volume = world
        .provider
        .volume(id)
        .ok_or_else(|| StepError::Assertion(format!("volume {id} was not seeded")))?;
    world.provider.insert_volume(Volume {
        state: VolumeState::Attached,
        server: Some(server),
        ..volume
    });
    Ok(())
}

#[given("provider creates take {millis} milliseconds")]
fn slow_creates(world: &ControllerWorld, millis: u64) {
    world
        .provider
        .set_latency(Call::Create, Duration::from_millis(millis));
}

#[given("provider attaches take {millis} milliseconds")]
fn slow_attaches(world: &ControllerWorld, millis: u64) {
    world
        .provider
        .set_latency(Call::Attach, Duration::from_millis(millis));
}

#[given("the next {times} attach calls fail transiently")]
fn flaky_attach(world: &ControllerWorld, times: u32) {
    world.provider.fail_times(
        Call::Attach,
        times,
        VolumeError::Transient(String::from("503 service unavailable")),
    );
}

#[given("attach calls are rate limited")]
fn rate_limited_attach(world: &ControllerWorld) {
    world.provider.fail_times(
        Call::Attach,
        100,
        VolumeError::RateLimited(String::from("rate_limit_exceeded")),
    );
}

#[when("CreateVolume \"{name}\" is called {times} times")]
fn create_sequentially(world: &ControllerWorld, name: String, times: usize) {
    let outcomes: Vec<Outcome> = (0..times)
        .map(|_| {
            let result = RUNTIME.block_on(
                world
                    .controller
                    .create_volume(Request::new(create_request(&name))),
            );
            result
                .map(|response| response.into_inner().volume.map(|volume| volume.volume_id))
                .map_err(|status| status.code())
        })
        .collect();
    world.record(outcomes);
}

#[when("{times} concurrent CreateVolume calls are made for \"{name}\"")]
fn create_concurrently(world: &ControllerWorld, times: usize, name: String) {
    let outcomes = RUNTIME.block_on(async {
        let handles: Vec<_> = (0..times)
            .map(|_| {
                let controller = world.controller.clone();
                let request = create_request(&name);
                tokio::spawn(async move { controller.create_volume(Request::new(request)).await })
            })
            .collect();
        let mut outcomes = Vec::with_capacity(times);
        for handle in handles {
            let outcome = match handle.await {
                Ok(result) => result
                    .map(|response| response.into_inner().volume.map(|volume| volume.volume_id))
                    .map_err(|status| status.code()),
                Err(err) => panic!("create task panicked: {err}"),
            };
            outcomes.push(outcome);
        }
        outcomes
    });
    world.record(outcomes);
}

#[when("DeleteVolume is called {times} times")]
fn delete_repeatedly(world: &ControllerWorld, times: usize) {
    let volume_id = world.volume_id();
    let outcomes: Vec<Outcome> = (0..times)
        .map(|_| {
            let request = DeleteVolumeRequest {
                volume_id: volume_id.clone(),
                ..DeleteVolumeRequest::default()
            };
            unit_outcome(RUNTIME.block_on(world.controller.delete_volume(Request::new(request))))
        })
        .collect();
    world.record(outcomes);
}

#[when("ControllerPublishVolume to node \"{node}\" is called {times} times")]
fn publish_repeatedly(world: &ControllerWorld, node: String, times: usize) {
    let volume_id = world.volume_id();
    let outcomes: Vec<Outcome> = (0..times)
        .map(|_| {
            let request = Request::new(publish_request(&volume_id, &node));
            unit_outcome(RUNTIME.block_on(world.controller.controller_publish_volume(request)))
        })
        .collect();
    world.record(outcomes);
}

#[when(
    "ControllerPublishVolume to node \"{node}\" is called with a {millis} millisecond deadline"
)]
fn publish_with_deadline(
    world: &ControllerWorld,
    node: String,
    millis: u64,
) -> Result<(), StepError> {
    let mut request = Request::new(publish_request(&world.volume_id(), &node));
    let timeout = format!("{millis}m")
        .parse()
        .map_err(|_| StepError::Argument(format!("bad timeout {millis}")))?;
    request.metadata_mut().insert("grpc-timeout", timeout);
    let outcome = unit_outcome(RUNTIME.block_on(world.controller.controller_publish_volume(request)));
    world.record([outcome]);
    Ok(())
}

#[then("every call returns the same volume id")]
fn same_volume_id(world: &ControllerWorld) -> Result<(), StepError> {
    let outcomes = world.outcomes.borrow();
    let ids: Vec<&str> = outcomes
        .iter()
        .map(|outcome| match outcome {
            Ok(Some(id)) => Ok(id.as_str()),
            other => Err(StepError::Assertion(format!(
                "expected a volume id, got {other:?}"
            ))),
        })
        .collect::<Result<_, _>>()?;
    match ids.split_first() {
        Some((first, rest)) if rest.iter().all(|id| id == first) => Ok(()),
        Some(_) => Err(StepError::Assertion(format!("volume ids diverged: {ids:?}"))),
        None => Err(StepError::Assertion(String::from("no calls recorded"))),
    }
}

#[then("every call succeeds")]
fn every_call_succeeds(world: &ControllerWorld) -> Result<(), StepError> {
    let outcomes = world.outcomes.borrow();
    if outcomes.is_empty() || outcomes.iter().any(Result::is_err) {
        return Err(StepError::Assertion(format!(
            "expected only successes, got {outcomes:?}"
        )));
    }
    Ok(())
}

#[then("every call fails with code \"{code}\"")]
fn every_call_fails(world: &ControllerWorld, code: String) -> Result<(), StepError> {
    let outcomes = world.outcomes.borrow();
    let all_match = !outcomes.is_empty()
        && outcomes
            .iter()
            .all(|outcome| matches!(outcome, Err(actual) if format!("{actual:?}") == code));
    if all_match {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected every call to fail with {code}, got {outcomes:?}"
        )))
    }
}

fn expect_calls(world: &ControllerWorld, call: Call, expected: u32) -> Result<(), StepError> {
    let actual = world.provider.calls(call);
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected} {call:?} calls, provider saw {actual}"
        )))
    }
}

#[then("the provider received {count} create calls")]
fn create_calls(world: &ControllerWorld, count: u32) -> Result<(), StepError> {
    expect_calls(world, Call::Create, count)
}

#[then("the provider received {count} delete calls")]
fn delete_calls(world: &ControllerWorld, count: u32) -> Result<(), StepError> {
    expect_calls(world, Call::Delete, count)
}

#[then("the provider received {count} attach calls")]
fn attach_calls(world: &ControllerWorld, count: u32) -> Result<(), StepError> {
    expect_calls(world, Call::Attach, count)
}

#[then("after {millis} milliseconds the volume is attached to node \"{node}\"")]
fn attached_after(world: &ControllerWorld, millis: u64, node: String) -> Result<(), StepError> {
    let server = parse_node(&node)?;
    let id: u64 = world
        .volume_id()
        .parse()
        .map_err(|_| StepError::Argument(String::from("seeded id is not numeric")))?;
    RUNTIME.block_on(async { tokio::time::sleep(Duration::from_millis(millis)).await });
    let attached = world.provider.volume(id).and_then(|volume| volume.server);
    if attached == Some(server) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected volume {id} on node {server}, found {attached:?}"
        )))
    }
}

#[then("the provider holds no volumes")]
fn no_volumes(world: &ControllerWorld) -> Result<(), StepError> {
    let remaining = world.provider.volumes();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no volumes, found {} of {} GiB",
            remaining.len(),
            remaining.iter().map(|volume| volume.size_bytes / GIB).sum::<u64>()
        )))
    }
}
