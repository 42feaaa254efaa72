//! CSI gRPC services exposed by the controller plugin.

pub mod controller;
mod deadline;
pub mod identity;
mod status;
mod validation;

pub use controller::ControllerService;
pub use identity::{IdentityService, ReadinessFlag};

/// Name the plugin registers under.
pub const PLUGIN_NAME: &str = "csi.hetzner.cloud";

/// Topology segment key carrying the volume location.
pub const TOPOLOGY_LOCATION_KEY: &str = "csi.hetzner.cloud/location";

#[cfg(test)]
mod tests;
