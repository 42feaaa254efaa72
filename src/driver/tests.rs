//! Controller RPC tests over the scripted volume provider.

use std::collections::HashMap;
use std::sync::Arc;

use rstest::{fixture, rstest};
use tonic::{Code, Request};

use super::{ControllerService, TOPOLOGY_LOCATION_KEY};
use crate::csi::controller_server::Controller;
use crate::csi::controller_service_capability::{self, rpc};
use crate::csi::volume_capability::access_mode::Mode;
use crate::csi::volume_capability::{AccessMode, AccessType, MountVolume};
use crate::csi::volume_content_source::{self, VolumeSource};
use crate::csi::{
    CapacityRange, ControllerExpandVolumeRequest, ControllerGetCapabilitiesRequest,
    ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    DeleteVolumeRequest, ListVolumesRequest, Topology, TopologyRequirement,
    ValidateVolumeCapabilitiesRequest, VolumeCapability, VolumeContentSource,
};
use crate::idempotent::IdempotentVolumeService;
use crate::test_support::{Call, ScriptedVolumeService};
use crate::volume::GIB;

struct Harness {
    provider: ScriptedVolumeService,
    controller: ControllerService,
}

#[fixture]
fn harness() -> Harness {
    let provider = ScriptedVolumeService::new();
    let volumes = IdempotentVolumeService::new(Arc::new(provider.clone()));
    Harness {
        provider,
        controller: ControllerService::new(Arc::new(volumes), "fsn1"),
    }
}

fn writer_capability() -> VolumeCapability {
    VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: String::from("ext4"),
            ..MountVolume::default()
        })),
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

fn publish_request(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.to_owned(),
        node_id: node_id.to_owned(),
        volume_capability: Some(writer_capability()),
        ..ControllerPublishVolumeRequest::default()
    }
}

#[rstest]
#[tokio::test]
async fn create_uses_default_size_and_location(harness: Harness) {
    let response = harness
        .controller
        .create_volume(Request::new(create_request("pvc-1")))
        .await
        .expect("create")
        .into_inner();

    let volume = response.volume.expect("volume in response");
    assert_eq!(volume.capacity_bytes, 10 * 1024 * 1024 * 1024);
    assert_eq!(
        volume.accessible_topology,
        vec![Topology {
            segments: HashMap::from([(TOPOLOGY_LOCATION_KEY.to_owned(), String::from("fsn1"))]),
        }]
    );
}

#[rstest]
#[tokio::test]
async fn repeated_create_returns_same_id(harness: Harness) {
    let first = harness
        .controller
        .create_volume(Request::new(create_request("pvc-1")))
        .await
        .expect("first")
        .into_inner();
    let second = harness
        .controller
        .create_volume(Request::new(create_request("pvc-1")))
        .await
        .expect("second")
        .into_inner();

    assert_eq!(
        first.volume.map(|volume| volume.volume_id),
        second.volume.map(|volume| volume.volume_id)
    );
    assert_eq!(harness.provider.calls(Call::Create), 1);
}

#[rstest]
#[tokio::test]
async fn create_honours_topology(harness: Harness) {
    let request = CreateVolumeRequest {
        accessibility_requirements: Some(TopologyRequirement {
            requisite: Vec::new(),
            preferred: vec![Topology {
                segments: HashMap::from([(
                    TOPOLOGY_LOCATION_KEY.to_owned(),
                    String::from("hel1"),
                )]),
            }],
        }),
        ..create_request("pvc-2")
    };

    harness
        .controller
        .create_volume(Request::new(request))
        .await
        .expect("create");

    let stored = harness.provider.volumes();
    assert_eq!(stored.first().map(|volume| volume.location.as_str()), Some("hel1"));
}

#[rstest]
#[tokio::test]
async fn create_with_mismatching_existing_volume_already_exists(harness: Harness) {
    harness.provider.seed("pvc-3", 10, "nbg1");

    let status = harness
        .controller
        .create_volume(Request::new(create_request("pvc-3")))
        .await
        .expect_err("location mismatch");

    assert_eq!(status.code(), Code::AlreadyExists);
}

#[rstest]
#[case(CreateVolumeRequest { name: String::new(), ..create_request("x") }, Code::InvalidArgument)]
#[case(CreateVolumeRequest { volume_capabilities: Vec::new(), ..create_request("x") }, Code::InvalidArgument)]
#[case(
    CreateVolumeRequest {
        capacity_range: Some(CapacityRange { required_bytes: 0, limit_bytes: 1024 }),
        ..create_request("x")
    },
    Code::OutOfRange
)]
#[case(
    CreateVolumeRequest {
        volume_content_source: Some(VolumeContentSource {
            r#type: Some(volume_content_source::Type::Volume(VolumeSource {
                volume_id: String::from("1"),
            })),
        }),
        ..create_request("x")
    },
    Code::InvalidArgument
)]
#[tokio::test]
async fn invalid_create_requests_are_rejected(
    harness: Harness,
    #[case] request: CreateVolumeRequest,
    #[case] expected: Code,
) {
    let status = harness
        .controller
        .create_volume(Request::new(request))
        .await
        .expect_err("invalid request");

    assert_eq!(status.code(), expected);
    assert_eq!(harness.provider.calls(Call::Create), 0);
}

#[rstest]
#[tokio::test]
async fn delete_of_unknown_or_foreign_id_succeeds(harness: Harness) {
    for volume_id in ["12345", "not-a-number"] {
        harness
            .controller
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: volume_id.to_owned(),
                ..DeleteVolumeRequest::default()
            }))
            .await
            .expect("delete is idempotent");
    }
    assert_eq!(harness.provider.calls(Call::Delete), 0);
}

#[rstest]
#[tokio::test]
async fn publish_twice_attaches_once(harness: Harness) {
    let id = harness.provider.seed("pvc-4", 10, "fsn1").to_string();

    for _ in 0..2 {
        harness
            .controller
            .controller_publish_volume(Request::new(publish_request(&id, "77")))
            .await
            .expect("publish");
    }

    assert_eq!(harness.provider.calls(Call::Attach), 1);
}

#[rstest]
#[tokio::test]
async fn publish_to_second_node_fails_precondition(harness: Harness) {
    let id = harness.provider.seed("pvc-5", 10, "fsn1").to_string();
    harness
        .controller
        .controller_publish_volume(Request::new(publish_request(&id, "77")))
        .await
        .expect("publish");

    let status = harness
        .controller
        .controller_publish_volume(Request::new(publish_request(&id, "78")))
        .await
        .expect_err("second node");

    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[rstest]
#[case(publish_request("abc", "77"), Code::NotFound)]
#[case(publish_request("1", "node-x"), Code::NotFound)]
#[case(ControllerPublishVolumeRequest { readonly: true, ..publish_request("1", "77") }, Code::InvalidArgument)]
#[case(ControllerPublishVolumeRequest { volume_capability: None, ..publish_request("1", "77") }, Code::InvalidArgument)]
#[case(publish_request("999", "77"), Code::NotFound)]
#[tokio::test]
async fn invalid_publish_requests_are_rejected(
    harness: Harness,
    #[case] request: ControllerPublishVolumeRequest,
    #[case] expected: Code,
) {
    harness.provider.seed("pvc-6", 10, "fsn1");

    let status = harness
        .controller
        .controller_publish_volume(Request::new(request))
        .await
        .expect_err("invalid publish");

    assert_eq!(status.code(), expected);
}

#[rstest]
#[tokio::test]
async fn unpublish_without_node_detaches_from_any(harness: Harness) {
    let id = harness.provider.seed("pvc-7", 10, "fsn1");
    harness
        .controller
        .controller_publish_volume(Request::new(publish_request(&id.to_string(), "77")))
        .await
        .expect("publish");

    harness
        .controller
        .controller_unpublish_volume(Request::new(ControllerUnpublishVolumeRequest {
            volume_id: id.to_string(),
            ..ControllerUnpublishVolumeRequest::default()
        }))
        .await
        .expect("unpublish");

    assert_eq!(harness.provider.volume(id).and_then(|volume| volume.server), None);
}

#[rstest]
#[tokio::test]
async fn validate_confirms_supported_capabilities(harness: Harness) {
    let id = harness.provider.seed("pvc-8", 10, "fsn1").to_string();

    let response = harness
        .controller
        .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
            volume_id: id,
            volume_capabilities: vec![writer_capability()],
            ..ValidateVolumeCapabilitiesRequest::default()
        }))
        .await
        .expect("validate")
        .into_inner();

    let confirmed = response.confirmed.expect("confirmed");
    assert_eq!(confirmed.volume_capabilities, vec![writer_capability()]);
}

#[rstest]
#[tokio::test]
async fn validate_unknown_volume_is_not_found(harness: Harness) {
    let status = harness
        .controller
        .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
            volume_id: String::from("404"),
            volume_capabilities: vec![writer_capability()],
            ..ValidateVolumeCapabilitiesRequest::default()
        }))
        .await
        .expect_err("missing volume");

    assert_eq!(status.code(), Code::NotFound);
}

#[rstest]
#[tokio::test]
async fn list_pages_by_offset_token(harness: Harness) {
    for name in ["pvc-a", "pvc-b", "pvc-c"] {
        harness.provider.seed(name, 10, "fsn1");
    }

    let first = harness
        .controller
        .list_volumes(Request::new(ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        }))
        .await
        .expect("first page")
        .into_inner();
    let second = harness
        .controller
        .list_volumes(Request::new(ListVolumesRequest {
            max_entries: 2,
            starting_token: first.next_token.clone(),
        }))
        .await
        .expect("second page")
        .into_inner();

    assert_eq!(first.entries.len(), 2);
    assert_eq!(first.next_token, "2");
    assert_eq!(second.entries.len(), 1);
    assert!(second.next_token.is_empty());
}

#[rstest]
#[tokio::test]
async fn list_with_bad_token_is_aborted(harness: Harness) {
    let status = harness
        .controller
        .list_volumes(Request::new(ListVolumesRequest {
            max_entries: 0,
            starting_token: String::from("bogus"),
        }))
        .await
        .expect_err("bad token");

    assert_eq!(status.code(), Code::Aborted);
}

#[rstest]
#[tokio::test]
async fn expand_reports_node_expansion(harness: Harness) {
    let id = harness.provider.seed("pvc-9", 10, "fsn1").to_string();

    let response = harness
        .controller
        .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
            volume_id: id,
            capacity_range: Some(CapacityRange {
                required_bytes: 20 * 1024 * 1024 * 1024,
                limit_bytes: 0,
            }),
            ..ControllerExpandVolumeRequest::default()
        }))
        .await
        .expect("expand")
        .into_inner();

    assert_eq!(
        u64::try_from(response.capacity_bytes).ok(),
        Some(20 * GIB)
    );
    assert!(response.node_expansion_required);
}

#[rstest]
#[tokio::test]
async fn capabilities_advertise_publish_and_expand(harness: Harness) {
    let response = harness
        .controller
        .controller_get_capabilities(Request::new(ControllerGetCapabilitiesRequest {}))
        .await
        .expect("capabilities")
        .into_inner();

    let kinds: Vec<i32> = response
        .capabilities
        .iter()
        .filter_map(|capability| match &capability.r#type {
            Some(controller_service_capability::Type::Rpc(entry)) => Some(entry.r#type),
            None => None,
        })
        .collect();
    assert!(kinds.contains(&i32::from(rpc::Type::PublishUnpublishVolume)));
    assert!(kinds.contains(&i32::from(rpc::Type::ExpandVolume)));
    assert!(!kinds.contains(&i32::from(rpc::Type::CreateDeleteSnapshot)));
}
