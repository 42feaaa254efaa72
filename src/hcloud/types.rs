//! Wire representations of Hetzner Cloud API payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::volume::{GIB, Volume, VolumeState};

pub(super) const MANAGED_BY_LABEL: &str = "managed-by";
pub(super) const MANAGED_BY_VALUE: &str = "hcloud-csi";

#[derive(Serialize)]
pub(super) struct CreateVolumeRequest<'a> {
    pub(super) name: &'a str,
    pub(super) size: u64,
    pub(super) location: &'a str,
    pub(super) labels: BTreeMap<&'static str, &'static str>,
    pub(super) automount: bool,
}

#[derive(Serialize)]
pub(super) struct AttachVolumeRequest {
    pub(super) server: u64,
    pub(super) automount: bool,
}

#[derive(Serialize)]
pub(super) struct ResizeVolumeRequest {
    pub(super) size: u64,
}

#[derive(Debug, Deserialize)]
pub(super) struct LocationResource {
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeResource {
    pub(super) id: u64,
    pub(super) name: String,
    pub(super) size: u64,
    pub(super) status: String,
    #[serde(default)]
    pub(super) server: Option<u64>,
    pub(super) location: LocationResource,
}

impl From<VolumeResource> for Volume {
    fn from(value: VolumeResource) -> Self {
        let state = match (value.status.as_str(), value.server) {
            ("creating", _) => VolumeState::Creating,
            ("available", Some(_)) => VolumeState::Attached,
            ("available", None) => VolumeState::Available,
            _ => VolumeState::Error,
        };
        Self {
            id: value.id,
            name: value.name,
            size_bytes: value.size.saturating_mul(GIB),
            location: value.location.name,
            state,
            server: value.server,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeEnvelope {
    pub(super) volume: VolumeResource,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateVolumeResponse {
    pub(super) volume: VolumeResource,
    #[serde(default)]
    pub(super) action: Option<ActionResource>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Pagination {
    #[serde(default)]
    pub(super) next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ListMeta {
    pub(super) pagination: Pagination,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeListResponse {
    pub(super) volumes: Vec<VolumeResource>,
    #[serde(default)]
    pub(super) meta: Option<ListMeta>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionFailure {
    pub(super) code: String,
    pub(super) message: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionResource {
    pub(super) id: u64,
    pub(super) status: String,
    #[serde(default)]
    pub(super) error: Option<ActionFailure>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionEnvelope {
    pub(super) action: ActionResource,
}

#[derive(Debug, Deserialize)]
pub(super) struct Datacenter {
    pub(super) location: LocationResource,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerResource {
    pub(super) datacenter: Datacenter,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: ServerResource,
}

#[derive(Debug, Deserialize)]
pub(super) struct ApiError {
    pub(super) code: String,
    pub(super) message: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ApiErrorEnvelope {
    pub(super) error: ApiError,
}
