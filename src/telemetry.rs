//! Tracing subscriber setup for the controller binary.
//!
//! Records are filtered through `RUST_LOG` (default `info`) and written to
//! stderr either as single-line text or as one JSON object per record.

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info,h2=warn,hyper=warn,tower=warn";

/// Encoding used for emitted log records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// Human readable single-line records.
    #[default]
    Text,
    /// One JSON object per record, including the current span fields.
    Json,
}

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed or could not be set.
    #[error("failed to initialise tracing subscriber: {0}")]
    SubscriberInit(String),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::SubscriberInit`] when a global subscriber is
/// already set.
pub fn init(format: LogFormat) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(env_filter());
    let outcome = match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
    };
    outcome.map_err(|err| TelemetryError::SubscriberInit(err.to_string()))
}
