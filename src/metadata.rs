//! Client for the Hetzner Cloud instance metadata service.
//!
//! Used at startup to find the server the controller runs on when no
//! default volume location is configured.

use std::time::Duration;

use thiserror::Error;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while querying the metadata service.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// Raised when the service cannot be reached.
    #[error("metadata service unreachable at {endpoint}: {message}")]
    Unreachable {
        /// URL that was requested.
        endpoint: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the service answers with a non-success status.
    #[error("metadata service returned HTTP {status} for {endpoint}")]
    Status {
        /// URL that was requested.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },
    /// Raised when the instance id is not numeric.
    #[error("metadata service returned invalid instance id '{0}'")]
    InvalidInstanceId(String),
}

fn unreachable(endpoint: &str, err: &reqwest::Error) -> MetadataError {
    MetadataError::Unreachable {
        endpoint: endpoint.to_owned(),
        message: err.to_string(),
    }
}

/// Reads instance metadata over HTTP.
#[derive(Clone, Debug)]
pub struct MetadataClient {
    endpoint: String,
    client: reqwest::Client,
}

impl MetadataClient {
    /// Creates a client for the metadata service at `endpoint`.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            client,
        }
    }

    async fn get_text(&self, key: &str) -> Result<String, MetadataError> {
        let url = format!("{}/{key}", self.endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| unreachable(&url, &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                endpoint: url,
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|err| unreachable(&url, &err))
    }

    /// Returns the id of the server this process runs on.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when the service is unreachable or answers
    /// with something other than a numeric id.
    pub async fn instance_id(&self) -> Result<u64, MetadataError> {
        let body = self.get_text("instance-id").await?;
        let trimmed = body.trim();
        trimmed
            .parse()
            .map_err(|_| MetadataError::InvalidInstanceId(trimmed.to_owned()))
    }
}
