//! CSI Identity service and the readiness flag it reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::csi::identity_server::Identity;
use crate::csi::plugin_capability::{self, Service, VolumeExpansion, service, volume_expansion};
use crate::csi::{
    BoolValue, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

use super::PLUGIN_NAME;

/// Readiness shared between the server lifecycle and the Identity service.
///
/// Starts unready and can only be switched on.
#[derive(Clone, Debug, Default)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl ReadinessFlag {
    /// Creates an unready flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the plugin ready.
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`ReadinessFlag::set_ready`] has been called.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Identity service reporting plugin metadata and readiness.
#[derive(Clone, Debug)]
pub struct IdentityService {
    readiness: ReadinessFlag,
}

impl IdentityService {
    /// Creates the service around a shared readiness flag.
    #[must_use]
    pub const fn new(readiness: ReadinessFlag) -> Self {
        Self { readiness }
    }
}

fn service_capability(kind: service::Type) -> PluginCapability {
    PluginCapability {
        r#type: Some(plugin_capability::Type::Service(Service {
            r#type: i32::from(kind),
        })),
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![
            service_capability(service::Type::ControllerService),
            service_capability(service::Type::VolumeAccessibilityConstraints),
            PluginCapability {
                r#type: Some(plugin_capability::Type::VolumeExpansion(VolumeExpansion {
                    r#type: i32::from(volume_expansion::Type::Online),
                })),
            },
        ];
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        let ready = self.readiness.is_ready();
        debug!(ready, "probe");
        Ok(Response::new(ProbeResponse {
            ready: Some(BoolValue { value: ready }),
        }))
    }
}
