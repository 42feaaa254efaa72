//! Volume endpoints of the Hetzner Cloud API.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::VolumeError;
use crate::volume::{
    CallContext, CreateOpts, GIB, Volume, VolumeFilter, VolumeLookup, VolumeState,
    bytes_to_gib_ceil,
};

use super::types::{
    ActionEnvelope, AttachVolumeRequest, CreateVolumeRequest, CreateVolumeResponse,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, ResizeVolumeRequest, VolumeEnvelope, VolumeListResponse,
};
use super::{HTTP_CLIENT, HcloudVolumeService, PAGE_SIZE};

impl HcloudVolumeService {
    pub(super) async fn create(
        &self,
        ctx: &CallContext,
        opts: &CreateOpts,
    ) -> Result<Volume, VolumeError> {
        if let Some(snapshot) = &opts.source_snapshot {
            return Err(VolumeError::Invalid(format!(
                "volumes cannot be restored from snapshot {snapshot}"
            )));
        }

        let payload = CreateVolumeRequest {
            name: &opts.name,
            size: bytes_to_gib_ceil(opts.min_size_bytes),
            location: &opts.location,
            labels: BTreeMap::from([(MANAGED_BY_LABEL, MANAGED_BY_VALUE)]),
            automount: false,
        };
        let created: CreateVolumeResponse = self
            .fetch(HTTP_CLIENT.post(self.url("/volumes")).json(&payload))
            .await?;

        let mut volume = Volume::from(created.volume);
        if let Some(action) = created.action {
            self.wait_for_action(ctx, action).await?;
            if volume.state == VolumeState::Creating {
                volume.state = VolumeState::Available;
            }
        }
        Ok(volume)
    }

    pub(super) async fn delete(&self, id: u64) -> Result<(), VolumeError> {
        self.execute(HTTP_CLIENT.delete(self.url(&format!("/volumes/{id}"))))
            .await
            .map(drop)
    }

    pub(super) async fn attach(
        &self,
        ctx: &CallContext,
        volume_id: u64,
        server_id: u64,
    ) -> Result<(), VolumeError> {
        let payload = AttachVolumeRequest {
            server: server_id,
            automount: false,
        };
        let envelope: ActionEnvelope = self
            .fetch(
                HTTP_CLIENT
                    .post(self.url(&format!("/volumes/{volume_id}/actions/attach")))
                    .json(&payload),
            )
            .await?;
        self.wait_for_action(ctx, envelope.action).await
    }

    pub(super) async fn detach(&self, ctx: &CallContext, volume_id: u64) -> Result<(), VolumeError> {
        let envelope: ActionEnvelope = self
            .fetch(HTTP_CLIENT.post(self.url(&format!("/volumes/{volume_id}/actions/detach"))))
            .await?;
        self.wait_for_action(ctx, envelope.action).await
    }

    pub(super) async fn resize(
        &self,
        ctx: &CallContext,
        id: u64,
        size_bytes: u64,
    ) -> Result<u64, VolumeError> {
        let size_gib = bytes_to_gib_ceil(size_bytes);
        let envelope: ActionEnvelope = self
            .fetch(
                HTTP_CLIENT
                    .post(self.url(&format!("/volumes/{id}/actions/resize")))
                    .json(&ResizeVolumeRequest { size: size_gib }),
            )
            .await?;
        self.wait_for_action(ctx, envelope.action).await?;
        Ok(size_gib.saturating_mul(GIB))
    }

    pub(super) async fn get(&self, lookup: &VolumeLookup) -> Result<Volume, VolumeError> {
        match lookup {
            VolumeLookup::Id(id) => {
                let envelope: VolumeEnvelope = self
                    .fetch(HTTP_CLIENT.get(self.url(&format!("/volumes/{id}"))))
                    .await?;
                Ok(Volume::from(envelope.volume))
            }
            VolumeLookup::Name(name) => {
                let listed: VolumeListResponse = self
                    .fetch(
                        HTTP_CLIENT
                            .get(self.url("/volumes"))
                            .query(&[("name", name.as_str())]),
                    )
                    .await?;
                listed
                    .volumes
                    .into_iter()
                    .find(|volume| &volume.name == name)
                    .map(Volume::from)
                    .ok_or_else(|| VolumeError::NotFound {
                        resource: lookup.to_string(),
                    })
            }
        }
    }

    pub(super) async fn list(&self, filter: &VolumeFilter) -> Result<Vec<Volume>, VolumeError> {
        let mut volumes = Vec::new();
        let mut page = Some(1_u32);

        while let Some(current) = page {
            let mut request = HTTP_CLIENT.get(self.url("/volumes")).query(&[
                ("page", current.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
            ]);
            if let Some(name) = &filter.name {
                request = request.query(&[("name", name)]);
            }
            let listed: VolumeListResponse = self.fetch(request).await?;
            debug!(page = current, count = listed.volumes.len(), "listed volume page");
            volumes.extend(listed.volumes.into_iter().map(Volume::from));
            page = listed
                .meta
                .and_then(|meta| meta.pagination.next_page)
                .filter(|next| *next > current);
        }
        Ok(volumes)
    }
}
