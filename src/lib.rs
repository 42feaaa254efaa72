//! Idempotent CSI controller plugin for Hetzner Cloud block volumes.
//!
//! Container orchestrators deliver controller RPCs at least once. The crate
//! layers an idempotency coordinator over a Hetzner Cloud volume adapter so
//! that retried create, delete, publish, unpublish and expand calls converge
//! on the same cloud state as a single execution would.

pub mod config;
pub mod csi;
pub mod driver;
pub mod error;
pub mod hcloud;
pub mod idempotent;
pub mod inflight;
pub mod metadata;
pub mod rate_limit;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod test_support;
pub mod volume;

pub use config::{ConfigError, CsiConfig, HcloudConfig};
pub use driver::{ControllerService, IdentityService, ReadinessFlag};
pub use error::{ErrorClass, VolumeError};
pub use hcloud::HcloudVolumeService;
pub use idempotent::IdempotentVolumeService;
pub use metadata::{MetadataClient, MetadataError};
pub use retry::RetryPolicy;
pub use server::{ListenEndpoint, PluginServer, ServeError};
pub use volume::{CallContext, CreateOpts, Volume, VolumeService, VolumeState};
