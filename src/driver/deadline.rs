//! Deadline propagation from inbound gRPC requests.

use std::time::Duration;

use tonic::Request;

use crate::volume::CallContext;

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
const MAX_TIMEOUT_DIGITS: usize = 8;

/// Parses a `grpc-timeout` value such as `30S` or `1500m`.
pub(crate) fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let mut chars = value.trim().chars();
    let unit = chars.next_back()?;
    let digits = chars.as_str();
    if digits.is_empty()
        || digits.len() > MAX_TIMEOUT_DIGITS
        || !digits.bytes().all(|byte| byte.is_ascii_digit())
    {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    match unit {
        'H' => Some(Duration::from_secs(amount.saturating_mul(3600))),
        'M' => Some(Duration::from_secs(amount.saturating_mul(60))),
        'S' => Some(Duration::from_secs(amount)),
        'm' => Some(Duration::from_millis(amount)),
        'u' => Some(Duration::from_micros(amount)),
        'n' => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Builds the call context for `request`, falling back to `default_timeout`
/// when the caller sent no usable deadline.
pub(crate) fn call_context<T>(request: &Request<T>, default_timeout: Duration) -> CallContext {
    let timeout = request
        .metadata()
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
        .unwrap_or(default_timeout);
    CallContext::with_timeout(timeout)
}
