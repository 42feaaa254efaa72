//! CSI Controller service.
//!
//! Each RPC validates its request, resolves defaults, calls the volume
//! service and translates the outcome. No state is kept between requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{Span, field, info, instrument};

use crate::config::DEFAULT_OPERATION_TIMEOUT_SECS;
use crate::csi::controller_server::Controller;
use crate::csi::controller_service_capability::{self, Rpc, rpc};
use crate::csi::list_volumes_response::{Entry, VolumeStatus};
use crate::csi::validate_volume_capabilities_response::Confirmed;
use crate::csi::volume_content_source;
use crate::csi::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, ListVolumesRequest, ListVolumesResponse, Topology,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
};
use crate::volume::{CallContext, CreateOpts, Volume, VolumeFilter, VolumeLookup, VolumeService};

use super::deadline::call_context;
use super::status::{self, RequestError};
use super::validation::{
    check_capabilities, expansion_size, is_supported, parse_id, requested_location, size_range,
};
use super::TOPOLOGY_LOCATION_KEY;

const CAPABILITIES: [rpc::Type; 5] = [
    rpc::Type::CreateDeleteVolume,
    rpc::Type::PublishUnpublishVolume,
    rpc::Type::ExpandVolume,
    rpc::Type::ListVolumes,
    rpc::Type::ListVolumesPublishedNodes,
];

/// Controller service translating CSI RPCs into volume operations.
#[derive(Clone)]
pub struct ControllerService {
    volumes: Arc<dyn VolumeService>,
    default_location: String,
    default_timeout: Duration,
}

impl ControllerService {
    /// Creates a controller over `volumes`, placing volumes without topology
    /// requirements in `default_location`.
    #[must_use]
    pub fn new(volumes: Arc<dyn VolumeService>, default_location: impl Into<String>) -> Self {
        Self {
            volumes,
            default_location: default_location.into(),
            default_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
        }
    }

    /// Sets the deadline used for requests without `grpc-timeout`.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn context<T>(&self, request: &Request<T>) -> CallContext {
        let ctx = call_context(request, self.default_timeout);
        Span::current().record("request_id", ctx.request_id.as_str());
        ctx
    }
}

fn non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str, RequestError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RequestError::missing(field));
    }
    Ok(trimmed)
}

fn capacity_bytes(size_bytes: u64) -> i64 {
    i64::try_from(size_bytes).unwrap_or(i64::MAX)
}

fn location_topology(location: &str) -> Topology {
    Topology {
        segments: HashMap::from([(TOPOLOGY_LOCATION_KEY.to_owned(), location.to_owned())]),
    }
}

fn csi_volume(volume: &Volume) -> crate::csi::Volume {
    crate::csi::Volume {
        capacity_bytes: capacity_bytes(volume.size_bytes),
        volume_id: volume.id.to_string(),
        volume_context: HashMap::new(),
        content_source: None,
        accessible_topology: vec![location_topology(&volume.location)],
    }
}

fn parse_offset(token: &str, total: usize) -> Result<usize, RequestError> {
    if token.is_empty() {
        return Ok(0);
    }
    let offset: usize = token
        .parse()
        .map_err(|_| RequestError::Aborted(format!("invalid starting token {token}")))?;
    if offset > total {
        return Err(RequestError::Aborted(format!(
            "starting token {token} is past the last volume"
        )));
    }
    Ok(offset)
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(skip_all, fields(request_id = field::Empty, name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let name = non_empty(&body.name, "volume name")?;
        check_capabilities(&body.volume_capabilities)?;
        let size = size_range(body.capacity_range.as_ref())?;
        let source_snapshot = match body.volume_content_source.and_then(|source| source.r#type) {
            Some(volume_content_source::Type::Volume(_)) => {
                return Err(RequestError::InvalidArgument(String::from(
                    "cloning volumes is not supported",
                ))
                .into());
            }
            Some(volume_content_source::Type::Snapshot(snapshot)) => Some(snapshot.snapshot_id),
            None => None,
        };
        let location = requested_location(body.accessibility_requirements.as_ref())
            .unwrap_or_else(|| self.default_location.clone());

        let opts = CreateOpts::new(name, size.size_bytes, location)
            .max_size_bytes(size.limit_bytes)
            .source_snapshot(source_snapshot);
        let volume = self
            .volumes
            .create_volume(&ctx, &opts)
            .await
            .map_err(|err| status::create_error(&err))?;

        info!(volume_id = volume.id, location = %volume.location, "volume ready");
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(csi_volume(&volume)),
        }))
    }

    #[instrument(skip_all, fields(request_id = field::Empty, volume_id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let raw_id = non_empty(&body.volume_id, "volume id")?;
        let Ok(id) = parse_id(raw_id, "volume") else {
            info!("volume id is not a provider id, treating as deleted");
            return Ok(Response::new(DeleteVolumeResponse {}));
        };
        self.volumes
            .delete_volume(&ctx, id)
            .await
            .map_err(|err| status::volume_error(&err))?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(
        skip_all,
        fields(
            request_id = field::Empty,
            volume_id = %request.get_ref().volume_id,
            node_id = %request.get_ref().node_id,
        )
    )]
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let volume_id = parse_id(non_empty(&body.volume_id, "volume id")?, "volume")?;
        let node_id = parse_id(non_empty(&body.node_id, "node id")?, "node")?;
        let capability = body
            .volume_capability
            .as_ref()
            .ok_or_else(|| RequestError::missing("volume capability"))?;
        if !is_supported(capability) {
            return Err(RequestError::InvalidArgument(String::from(
                "volume capability not supported",
            ))
            .into());
        }
        if body.readonly {
            return Err(RequestError::InvalidArgument(String::from(
                "read-only attachments are not supported",
            ))
            .into());
        }

        self.volumes
            .attach_volume(&ctx, volume_id, node_id)
            .await
            .map_err(|err| status::volume_error(&err))?;
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: HashMap::new(),
        }))
    }

    #[instrument(
        skip_all,
        fields(
            request_id = field::Empty,
            volume_id = %request.get_ref().volume_id,
            node_id = %request.get_ref().node_id,
        )
    )]
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let raw_id = non_empty(&body.volume_id, "volume id")?;
        let Ok(volume_id) = parse_id(raw_id, "volume") else {
            info!("volume id is not a provider id, nothing to detach");
            return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
        };
        let node_id = match body.node_id.trim() {
            "" => None,
            raw_node => match parse_id(raw_node, "node") {
                Ok(id) => Some(id),
                Err(_) => {
                    info!("node id is not a provider id, nothing to detach");
                    return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
                }
            },
        };

        self.volumes
            .detach_volume(&ctx, volume_id, node_id)
            .await
            .map_err(|err| status::volume_error(&err))?;
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    #[instrument(skip_all, fields(request_id = field::Empty, volume_id = %request.get_ref().volume_id))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let volume_id = parse_id(non_empty(&body.volume_id, "volume id")?, "volume")?;
        if body.volume_capabilities.is_empty() {
            return Err(RequestError::missing("volume capabilities").into());
        }
        self.volumes
            .get_volume(&ctx, &VolumeLookup::Id(volume_id))
            .await
            .map_err(|err| status::volume_error(&err))?;

        if !body.volume_capabilities.iter().all(is_supported) {
            return Ok(Response::new(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: String::from("only single node writer access is supported"),
            }));
        }
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: body.volume_context,
                volume_capabilities: body.volume_capabilities,
                parameters: body.parameters,
                mutable_parameters: body.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    #[instrument(skip_all, fields(request_id = field::Empty))]
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let max_entries = usize::try_from(body.max_entries).map_err(|_| {
            RequestError::InvalidArgument(String::from("max_entries must not be negative"))
        })?;
        let mut volumes = self
            .volumes
            .list_volumes(&ctx, &VolumeFilter::default())
            .await
            .map_err(|err| status::volume_error(&err))?;
        volumes.sort_by_key(|volume| volume.id);

        let offset = parse_offset(&body.starting_token, volumes.len())?;
        let page_size = if max_entries == 0 {
            volumes.len()
        } else {
            max_entries
        };
        let end = offset.saturating_add(page_size).min(volumes.len());
        let entries: Vec<Entry> = volumes
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|volume| Entry {
                volume: Some(csi_volume(volume)),
                status: Some(VolumeStatus {
                    published_node_ids: volume.server.iter().map(u64::to_string).collect(),
                    volume_condition: None,
                }),
            })
            .collect();
        let next_token = if end < volumes.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = CAPABILITIES
            .iter()
            .map(|kind| ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(Rpc {
                    r#type: i32::from(*kind),
                })),
            })
            .collect();
        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }

    #[instrument(skip_all, fields(request_id = field::Empty, volume_id = %request.get_ref().volume_id))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let ctx = self.context(&request);
        let body = request.into_inner();

        let volume_id = parse_id(non_empty(&body.volume_id, "volume id")?, "volume")?;
        let size_bytes = expansion_size(body.capacity_range.as_ref())?;
        let resized = self
            .volumes
            .resize_volume(&ctx, volume_id, size_bytes)
            .await
            .map_err(|err| status::volume_error(&err))?;

        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: capacity_bytes(resized),
            node_expansion_required: true,
        }))
    }
}
