//! Classification of Hetzner Cloud API failures into [`VolumeError`].

use reqwest::StatusCode;

use crate::error::VolumeError;

use super::types::ApiErrorEnvelope;

/// Maps an API error code and message to the domain taxonomy.
///
/// `status` is only consulted for codes the API does not document.
pub(super) fn classify(code: &str, message: &str, status: Option<StatusCode>) -> VolumeError {
    let detail = format!("{code}: {message}");
    match code {
        "not_found" => VolumeError::NotFound { resource: detail },
        "uniqueness_error" | "conflict" => VolumeError::Conflict(detail),
        "rate_limit_exceeded" => VolumeError::RateLimited(detail),
        "locked" | "server_error" | "unavailable" | "timeout" | "service_error"
        | "maintenance" => VolumeError::Transient(detail),
        "invalid_input" | "json_error" | "resource_limit_exceeded" | "forbidden"
        | "unauthorized" => VolumeError::Invalid(detail),
        _ => match status {
            Some(value) => classify_status(value, detail),
            None => VolumeError::Internal(detail),
        },
    }
}

fn classify_status(status: StatusCode, detail: String) -> VolumeError {
    match status {
        StatusCode::NOT_FOUND => VolumeError::NotFound { resource: detail },
        StatusCode::CONFLICT => VolumeError::Conflict(detail),
        StatusCode::TOO_MANY_REQUESTS => VolumeError::RateLimited(detail),
        other if other.is_server_error() => VolumeError::Transient(detail),
        other if other.is_client_error() => VolumeError::Invalid(detail),
        _ => VolumeError::Internal(detail),
    }
}

/// Classifies a non-success HTTP response.
pub(super) fn from_response(status: StatusCode, body: &[u8]) -> VolumeError {
    match serde_json::from_slice::<ApiErrorEnvelope>(body) {
        Ok(envelope) => classify(
            &envelope.error.code,
            &envelope.error.message,
            Some(status),
        ),
        Err(_) => classify_status(
            status,
            format!("HTTP {status}: {}", String::from_utf8_lossy(body)),
        ),
    }
}

/// Classifies a failure to reach the API at all.
pub(super) fn from_transport(err: &reqwest::Error) -> VolumeError {
    VolumeError::Transient(format!("request failed: {err}"))
}

/// Classifies a success response whose body cannot be decoded.
pub(super) fn from_decode(err: &serde_json::Error) -> VolumeError {
    VolumeError::Internal(format!("unexpected response body: {err}"))
}
