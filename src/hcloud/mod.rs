//! Hetzner Cloud implementation of the volume operation interface.
//!
//! The adapter translates each operation into one API request (plus action
//! polling where the API answers asynchronously) and classifies failures. It
//! neither retries nor deduplicates; that is the job of
//! [`crate::idempotent::IdempotentVolumeService`].

mod actions;
mod error;
mod types;
mod volumes;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

use crate::config::HcloudConfig;
use crate::error::VolumeError;
use crate::rate_limit::RateBudget;
use crate::volume::{
    CallContext, CreateOpts, Volume, VolumeFilter, VolumeFuture, VolumeLookup, VolumeService,
};

/// Public Hetzner Cloud API base URL.
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const PAGE_SIZE: u32 = 50;
const DEFAULT_RATE_PER_SECOND: u32 = 5;
const DEFAULT_RATE_BURST: u32 = 20;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("hcloud-csi/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Volume service backed by the Hetzner Cloud API.
#[derive(Clone)]
pub struct HcloudVolumeService {
    endpoint: String,
    token: String,
    budget: Arc<RateBudget>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl HcloudVolumeService {
    /// Creates an adapter talking to `endpoint` with the default rate budget.
    #[must_use]
    pub fn new(endpoint: &str, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            token: token.into(),
            budget: Arc::new(RateBudget::new(DEFAULT_RATE_PER_SECOND, DEFAULT_RATE_BURST)),
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        }
    }

    /// Creates an adapter from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &HcloudConfig) -> Self {
        Self::new(&config.endpoint, config.token.clone()).with_rate_budget(RateBudget::new(
            config.rate_limit_per_second,
            config.rate_limit_burst,
        ))
    }

    /// Replaces the outbound request budget.
    #[must_use]
    pub fn with_rate_budget(mut self, budget: RateBudget) -> Self {
        self.budget = Arc::new(budget);
        self
    }

    /// Sets how often pending actions are polled.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the longest time spent waiting for one action.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Vec<u8>, VolumeError> {
        self.budget.try_acquire()?;
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| error::from_transport(&err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| error::from_transport(&err))?;

        if status.is_success() {
            return Ok(body.to_vec());
        }
        Err(error::from_response(status, &body))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, VolumeError> {
        let body = self.execute(request).await?;
        serde_json::from_slice(&body).map_err(|err| error::from_decode(&err))
    }

    /// Returns the location name of the server with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NotFound`] when the server does not exist, or
    /// the classified API error.
    pub async fn server_location(&self, server_id: u64) -> Result<String, VolumeError> {
        let envelope: types::ServerEnvelope = self
            .fetch(HTTP_CLIENT.get(self.url(&format!("/servers/{server_id}"))))
            .await?;
        Ok(envelope.server.datacenter.location.name)
    }
}

impl VolumeService for HcloudVolumeService {
    fn create_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        opts: &'a CreateOpts,
    ) -> VolumeFuture<'a, Volume> {
        Box::pin(self.create(ctx, opts))
    }

    fn delete_volume<'a>(&'a self, _ctx: &'a CallContext, id: u64) -> VolumeFuture<'a, ()> {
        Box::pin(self.delete(id))
    }

    fn attach_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        volume_id: u64,
        server_id: u64,
    ) -> VolumeFuture<'a, ()> {
        Box::pin(self.attach(ctx, volume_id, server_id))
    }

    fn detach_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        volume_id: u64,
        _server_id: Option<u64>,
    ) -> VolumeFuture<'a, ()> {
        Box::pin(self.detach(ctx, volume_id))
    }

    fn resize_volume<'a>(
        &'a self,
        ctx: &'a CallContext,
        id: u64,
        size_bytes: u64,
    ) -> VolumeFuture<'a, u64> {
        Box::pin(self.resize(ctx, id, size_bytes))
    }

    fn get_volume<'a>(
        &'a self,
        _ctx: &'a CallContext,
        lookup: &'a VolumeLookup,
    ) -> VolumeFuture<'a, Volume> {
        Box::pin(self.get(lookup))
    }

    fn list_volumes<'a>(
        &'a self,
        _ctx: &'a CallContext,
        filter: &'a VolumeFilter,
    ) -> VolumeFuture<'a, Vec<Volume>> {
        Box::pin(self.list(filter))
    }
}
