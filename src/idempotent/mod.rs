//! Idempotent decorator over a [`VolumeService`].
//!
//! Every mutating operation first observes provider state and only issues
//! the provider call that is still needed. Concurrent calls for the same
//! logical operation share a single in-flight run, and retryable failures are
//! retried until the latest deadline among the callers sharing the run. Each
//! caller stops waiting at its own deadline while the run carries on.

use std::future::Future;
use std::sync::Arc;

use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use crate::error::VolumeError;
use crate::inflight::{InFlightRegistry, OperationKey, OperationKind};
use crate::retry::{RetryPolicy, WorkDeadline, run_with_retry};
use crate::volume::{
    CallContext, CreateOpts, Volume, VolumeFilter, VolumeFuture, VolumeLookup, VolumeService,
};

/// Volume service that makes retried and concurrent requests safe.
pub struct IdempotentVolumeService {
    inner: Arc<dyn VolumeService>,
    policy: RetryPolicy,
    creates: InFlightRegistry<CreateOpts, Volume>,
    mutations: InFlightRegistry<Option<u64>, ()>,
    resizes: InFlightRegistry<u64, u64>,
}

impl IdempotentVolumeService {
    /// Wraps `inner` using the default retry policy.
    #[must_use]
    pub fn new(inner: Arc<dyn VolumeService>) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
            creates: InFlightRegistry::new(),
            mutations: InFlightRegistry::new(),
            resizes: InFlightRegistry::new(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn worker(&self, ctx: &CallContext, deadline: WorkDeadline) -> Worker {
        Worker {
            inner: Arc::clone(&self.inner),
            policy: self.policy.clone(),
            request_id: ctx.request_id.clone(),
            deadline,
        }
    }

    async fn read<T, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: &str,
        call: F,
    ) -> Result<T, VolumeError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn VolumeService>, CallContext) -> Fut,
        Fut: Future<Output = Result<T, VolumeError>> + Send + 'static,
    {
        let worker = self.worker(ctx, WorkDeadline::new(ctx.deadline));
        timeout_at(ctx.deadline, worker.call(operation, call))
            .await
            .unwrap_or_else(|_elapsed| {
                Err(VolumeError::DeadlineExceeded {
                    operation: operation.to_owned(),
                })
            })
    }

    /// Returns the volume named `opts.name`, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Conflict`] when a volume with the same name but
    /// incompatible size or location exists, or the classified provider error.
    pub async fn ensure_volume(
        &self,
        ctx: &CallContext,
        opts: &CreateOpts,
    ) -> Result<Volume, VolumeError> {
        let owned = opts.clone();
        let key = OperationKey::new(OperationKind::Create, &opts.name);
        self.creates
            .run(ctx, &key, opts, move |deadline| {
                let worker = self.worker(ctx, deadline);
                async move { worker.reconcile_create(owned).await }
            })
            .await
    }

    /// Deletes the volume, treating an already absent volume as success.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::FailedPrecondition`] while the volume is still
    /// attached, or the classified provider error.
    pub async fn ensure_deleted(&self, ctx: &CallContext, id: u64) -> Result<(), VolumeError> {
        let key = OperationKey::new(OperationKind::Delete, id);
        self.mutations
            .run(ctx, &key, &None, move |deadline| {
                let worker = self.worker(ctx, deadline);
                async move { worker.reconcile_delete(id).await }
            })
            .await
    }

    /// Attaches the volume to `node_id` unless it already is.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::FailedPrecondition`] when the volume is attached
    /// to another node, [`VolumeError::NotFound`] when it does not exist, or
    /// the classified provider error.
    pub async fn ensure_attached(
        &self,
        ctx: &CallContext,
        volume_id: u64,
        node_id: u64,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(OperationKind::Attach, volume_id);
        self.mutations
            .run(ctx, &key, &Some(node_id), move |deadline| {
                let worker = self.worker(ctx, deadline);
                async move { worker.reconcile_attach(volume_id, node_id).await }
            })
            .await
    }

    /// Detaches the volume unless it is already detached.
    ///
    /// With `node_id` set, an attachment to any other node is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::FailedPrecondition`] when the volume is attached
    /// to a different node than requested, or the classified provider error.
    pub async fn ensure_detached(
        &self,
        ctx: &CallContext,
        volume_id: u64,
        node_id: Option<u64>,
    ) -> Result<(), VolumeError> {
        let key = OperationKey::new(OperationKind::Detach, volume_id);
        self.mutations
            .run(ctx, &key, &node_id, move |deadline| {
                let worker = self.worker(ctx, deadline);
                async move { worker.reconcile_detach(volume_id, node_id).await }
            })
            .await
    }

    /// Grows the volume to at least `size_bytes` and returns its size.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NotFound`] when the volume does not exist, or
    /// the classified provider error.
    pub async fn ensure_resized(
        &self,
        ctx: &CallContext,
        id: u64,
        size_bytes: u64,
    ) -> Result<u64, VolumeError> {
        let key = OperationKey::new(OperationKind::Resize, id);
        self.resizes
            .run(ctx, &key, &size_bytes, move |deadline| {
                let worker = self.worker(ctx, deadline);
                async move { worker.reconcile_resize(id, size_bytes).await }
            })
            .await
    }
}

/// Owned state for one deduplicated run.
#[derive(Clone)]
struct Worker {
    inner: Arc<dyn VolumeService>,
    policy: RetryPolicy,
    request_id: String,
    deadline: WorkDeadline,
}

impl Worker {
    async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, VolumeError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn VolumeService>, CallContext) -> Fut,
        Fut: Future<Output = Result<T, VolumeError>> + Send + 'static,
    {
        run_with_retry(&self.policy, &self.deadline, operation, || {
            let attempt = CallContext {
                deadline: self.deadline.current(),
                request_id: self.request_id.clone(),
            };
            call(Arc::clone(&self.inner), attempt)
        })
        .await
    }

    async fn find(&self, lookup: VolumeLookup) -> Result<Option<Volume>, VolumeError> {
        let found = self
            .call("get volume", move |svc, ctx| {
                let selector = lookup.clone();
                async move { svc.get_volume(&ctx, &selector).await }
            })
            .await;
        match found {
            Ok(volume) => Ok(Some(volume)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn adopt_existing(&self, existing: Volume, opts: &CreateOpts) -> Result<Volume, VolumeError> {
        if existing.matches(opts) {
            debug!(
                request_id = %self.request_id,
                volume_id = existing.id,
                name = %existing.name,
                "volume already exists with matching parameters"
            );
            return Ok(existing);
        }
        Err(VolumeError::Conflict(format!(
            "volume {} exists with size {} bytes in {}, requested at least {} bytes in {}",
            existing.name,
            existing.size_bytes,
            existing.location,
            opts.min_size_bytes,
            opts.location
        )))
    }

    async fn reconcile_create(&self, opts: CreateOpts) -> Result<Volume, VolumeError> {
        if let Some(existing) = self.find(VolumeLookup::Name(opts.name.clone())).await? {
            return self.adopt_existing(existing, &opts);
        }

        let request = opts.clone();
        let created = self
            .call("create volume", move |svc, ctx| {
                let attempt = request.clone();
                async move { svc.create_volume(&ctx, &attempt).await }
            })
            .await;

        match created {
            Ok(volume) => {
                info!(
                    request_id = %self.request_id,
                    volume_id = volume.id,
                    name = %volume.name,
                    location = %volume.location,
                    "volume created"
                );
                Ok(volume)
            }
            Err(VolumeError::Conflict(message)) => {
                warn!(
                    request_id = %self.request_id,
                    name = %opts.name,
                    %message,
                    "create reported a name conflict, reconciling by name"
                );
                match self.find(VolumeLookup::Name(opts.name.clone())).await? {
                    Some(existing) => self.adopt_existing(existing, &opts),
                    None => Err(VolumeError::Conflict(message)),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn reconcile_delete(&self, id: u64) -> Result<(), VolumeError> {
        let Some(existing) = self.find(VolumeLookup::Id(id)).await? else {
            debug!(request_id = %self.request_id, volume_id = id, "volume already deleted");
            return Ok(());
        };
        if let Some(server) = existing.server {
            return Err(VolumeError::FailedPrecondition(format!(
                "volume {id} is still attached to server {server}"
            )));
        }

        let deleted = self
            .call("delete volume", move |svc, ctx| async move {
                svc.delete_volume(&ctx, id).await
            })
            .await;
        match deleted {
            Ok(()) => {
                info!(request_id = %self.request_id, volume_id = id, "volume deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(request_id = %self.request_id, volume_id = id, "volume deleted concurrently");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn reconcile_attach(&self, volume_id: u64, node_id: u64) -> Result<(), VolumeError> {
        let existing = self
            .find(VolumeLookup::Id(volume_id))
            .await?
            .ok_or_else(|| VolumeError::volume_not_found(volume_id))?;
        if Self::attachment_settled(&existing, node_id)? {
            return Ok(());
        }

        let attached = self
            .call("attach volume", move |svc, ctx| async move {
                svc.attach_volume(&ctx, volume_id, node_id).await
            })
            .await;
        match attached {
            Ok(()) => {
                info!(
                    request_id = %self.request_id,
                    volume_id,
                    server_id = node_id,
                    "volume attached"
                );
                Ok(())
            }
            Err(VolumeError::Conflict(message)) => {
                let current = self
                    .find(VolumeLookup::Id(volume_id))
                    .await?
                    .ok_or_else(|| VolumeError::volume_not_found(volume_id))?;
                if Self::attachment_settled(&current, node_id)? {
                    return Ok(());
                }
                Err(VolumeError::Conflict(message))
            }
            Err(err) => Err(err),
        }
    }

    /// `Ok(true)` when already attached to `node_id`, `Ok(false)` when
    /// unattached.
    fn attachment_settled(volume: &Volume, node_id: u64) -> Result<bool, VolumeError> {
        match volume.server {
            Some(server) if server == node_id => Ok(true),
            Some(server) => Err(VolumeError::FailedPrecondition(format!(
                "volume {} is attached to server {server}, not {node_id}",
                volume.id
            ))),
            None => Ok(false),
        }
    }

    async fn reconcile_detach(
        &self,
        volume_id: u64,
        node_id: Option<u64>,
    ) -> Result<(), VolumeError> {
        let Some(existing) = self.find(VolumeLookup::Id(volume_id)).await? else {
            debug!(request_id = %self.request_id, volume_id, "volume gone, nothing to detach");
            return Ok(());
        };
        let Some(server) = existing.server else {
            debug!(request_id = %self.request_id, volume_id, "volume already detached");
            return Ok(());
        };
        if let Some(requested) = node_id.filter(|requested| *requested != server) {
            return Err(VolumeError::FailedPrecondition(format!(
                "volume {volume_id} is attached to server {server}, not {requested}"
            )));
        }

        let detached = self
            .call("detach volume", move |svc, ctx| async move {
                svc.detach_volume(&ctx, volume_id, Some(server)).await
            })
            .await;
        match detached {
            Ok(()) => {
                info!(
                    request_id = %self.request_id,
                    volume_id,
                    server_id = server,
                    "volume detached"
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn reconcile_resize(&self, id: u64, size_bytes: u64) -> Result<u64, VolumeError> {
        let existing = self
            .find(VolumeLookup::Id(id))
            .await?
            .ok_or_else(|| VolumeError::volume_not_found(id))?;
        if existing.size_bytes >= size_bytes {
            debug!(
                request_id = %self.request_id,
                volume_id = id,
                size_bytes = existing.size_bytes,
                "volume already large enough"
            );
            return Ok(existing.size_bytes);
        }

        let resized = self
            .call("resize volume", move |svc, ctx| async move {
                svc.resize_volume(&ctx, id, size_bytes).await
            })
            .await?;
        info!(request_id = %self.request_id, volume_id = id, size_bytes = resized, "volume resized");
        Ok(resized)
    }
}

impl VolumeService for IdempotentVolumeService {
    fn create_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        opts: &'a CreateOpts,
    ) -> VolumeFuture<'a, Volume> {
        Box::pin(self.ensure_volume(ctx, opts))
    }

    fn delete_volume<'a>(&'a self, ctx: &'a CallContext, id: u64) -> VolumeFuture<'a, ()> {
        Box::pin(self.ensure_deleted(ctx, id))
    }

    fn attach_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        volume_id: u64,
        server_id: u64,
    ) -> VolumeFuture<'a, ()> {
        Box::pin(self.ensure_attached(ctx, volume_id, server_id))
    }

    fn detach_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        volume_id: u64,
        server_id: Option<u64>,
    ) -> VolumeFuture<'a, ()> {
        Box::pin(self.ensure_detached(ctx, volume_id, server_id))
    }

    fn resize_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        id: u64,
        size_bytes: u64,
    ) -> VolumeFuture<'a, u64> {
        Box::pin(self.ensure_resized(ctx, id, size_bytes))
    }

    fn get_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        lookup: &'a VolumeLookup,
    ) -> VolumeFuture<'a, Volume> {
        Box::pin(async move {
            let owned = lookup.clone();
            self.read(ctx, "get volume", move |svc, call_ctx| {
                let selector = owned.clone();
                async move { svc.get_volume(&call_ctx, &selector).await }
            })
            .await
        })
    }

    fn list_volumes<'a>(
        &'a self,
        ctx: &'a CallContext,
        filter: &'a VolumeFilter,
    ) -> VolumeFuture<'a, Vec<Volume>> {
        Box::pin(async move {
            let owned = filter.clone();
            self.read(ctx, "list volumes", move |svc, call_ctx| {
                let selector = owned.clone();
                async move { svc.list_volumes(&call_ctx, &selector).await }
            })
            .await
        })
    }
}
