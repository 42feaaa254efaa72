//! Volume domain types and the operation interface shared by the cloud
//! adapter and the idempotent decorator.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::VolumeError;

/// Bytes in one gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Lifecycle state of a provider volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// The provider is still allocating the volume.
    Creating,
    /// The volume exists and is not attached.
    Available,
    /// The volume is attached to a server.
    Attached,
    /// The provider is removing the volume.
    Deleting,
    /// The provider reports a state the controller cannot use.
    Error,
}

/// Provider volume as observed through the cloud API.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider-assigned identifier.
    pub id: u64,
    /// Caller-assigned unique name.
    pub name: String,
    /// Provisioned size in bytes.
    pub size_bytes: u64,
    /// Location (for example `fsn1`) the volume lives in.
    pub location: String,
    /// Lifecycle state.
    pub state: VolumeState,
    /// Server the volume is attached to, if any.
    pub server: Option<u64>,
}

impl Volume {
    /// Returns `true` when the volume satisfies the size and location
    /// constraints of `opts`.
    #[must_use]
    pub fn matches(&self, opts: &CreateOpts) -> bool {
        self.size_bytes >= opts.min_size_bytes
            && opts.max_size_bytes.is_none_or(|max| self.size_bytes <= max)
            && self.location == opts.location
    }
}

/// Parameters for creating a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateOpts {
    /// Caller-assigned name, doubling as the idempotency key.
    pub name: String,
    /// Smallest acceptable size in bytes.
    pub min_size_bytes: u64,
    /// Largest acceptable size in bytes, when bounded.
    pub max_size_bytes: Option<u64>,
    /// Target location.
    pub location: String,
    /// Snapshot to restore from.
    pub source_snapshot: Option<String>,
}

impl CreateOpts {
    /// Creates options for a fresh volume, trimming string fields.
    #[must_use]
    pub fn new(name: impl Into<String>, min_size_bytes: u64, location: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            min_size_bytes,
            max_size_bytes: None,
            location: location.into().trim().to_owned(),
            source_snapshot: None,
        }
    }

    /// Sets the upper size bound.
    #[must_use]
    pub const fn max_size_bytes(mut self, value: Option<u64>) -> Self {
        self.max_size_bytes = value;
        self
    }

    /// Sets the snapshot to restore from.
    #[must_use]
    pub fn source_snapshot(mut self, value: Option<String>) -> Self {
        self.source_snapshot = value;
        self
    }
}

/// Selector for single-volume lookups.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeLookup {
    /// Look up by provider identifier.
    Id(u64),
    /// Look up by caller-assigned name.
    Name(String),
}

impl fmt::Display for VolumeLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "volume {id}"),
            Self::Name(name) => write!(f, "volume named {name}"),
        }
    }
}

/// Filter for listing volumes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeFilter {
    /// Only return the volume with this exact name.
    pub name: Option<String>,
}

/// Request-scoped context handed to every volume operation.
///
/// The deadline is the one propagated from the inbound RPC; it bounds the
/// whole retry loop, not individual attempts.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Instant after which the caller no longer waits.
    pub deadline: Instant,
    /// Correlation identifier used in log records.
    pub request_id: String,
}

impl CallContext {
    /// Creates a context that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Creates a context expiring at `deadline` with a fresh request id.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            request_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Future returned by volume operations.
pub type VolumeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, VolumeError>> + Send + 'a>>;

/// Volume operations offered by a cloud provider.
///
/// Implemented by the raw Hetzner adapter and by the idempotent decorator so
/// the controller depends only on this interface.
pub trait VolumeService: Send + Sync {
    /// Creates a volume from `opts` and returns it.
    fn create_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        opts: &'a CreateOpts,
    ) -> VolumeFuture<'a, Volume>;

    /// Deletes the volume with the given id.
    fn delete_volume<'a>(&'a self, ctx: &'a CallContext, id: u64) -> VolumeFuture<'a, ()>;

    /// Attaches a volume to a server.
    fn attach_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        volume_id: u64,
        server_id: u64,
    ) -> VolumeFuture<'a, ()>;

    /// Detaches a volume; `server_id` names the expected attachment when known.
    fn detach_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        volume_id: u64,
        server_id: Option<u64>,
    ) -> VolumeFuture<'a, ()>;

    /// Grows a volume to at least `size_bytes` and returns the resulting size.
    fn resize_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        id: u64,
        size_bytes: u64,
    ) -> VolumeFuture<'a, u64>;

    /// Fetches a single volume; absence is reported as `NotFound`.
    fn get_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        lookup: &'a VolumeLookup,
    ) -> VolumeFuture<'a, Volume>;

    /// Lists volumes matching `filter`.
    fn list_volumes<'a>(
        &'a self,
        ctx: &'a CallContext,
        filter: &'a VolumeFilter,
    ) -> VolumeFuture<'a, Vec<Volume>>;
}

/// Converts a byte count to whole gibibytes, rounding up.
#[must_use]
pub const fn bytes_to_gib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}
