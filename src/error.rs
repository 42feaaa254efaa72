//! Domain error taxonomy shared by every volume operation.

use thiserror::Error;

/// Coarse classification used by retry policies and status mapping.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorClass {
    /// The addressed resource does not exist.
    NotFound,
    /// The request collides with existing provider state.
    Conflict,
    /// The request is malformed or unsupported.
    Invalid,
    /// The outbound API budget is spent.
    RateLimited,
    /// Network failure or provider-side 5xx.
    Transient,
    /// Observed state forbids the operation.
    FailedPrecondition,
    /// The retry budget was spent on retryable failures.
    Exhausted,
    /// The caller deadline passed before an outcome was known.
    DeadlineExceeded,
    /// Anything the adapter could not classify.
    Internal,
}

/// Errors raised by volume operations.
///
/// The type is `Clone` so a single outcome can be handed to every caller
/// waiting on the same in-flight operation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VolumeError {
    /// Raised when the volume or server cannot be found.
    #[error("{resource} not found")]
    NotFound {
        /// Human-readable resource description (for example `volume 42`).
        resource: String,
    },
    /// Raised when a name or attachment collides with existing state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Raised when the provider rejects the parameters.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Raised when the outbound request budget is exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Raised on network failures and provider-side errors.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Raised when the observed state forbids the request.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// Raised when every permitted attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts performed.
        attempts: u32,
        /// Error returned by the final attempt.
        last: Box<VolumeError>,
    },
    /// Raised when the caller deadline passes before the outcome is known.
    #[error("deadline exceeded while waiting for {operation}")]
    DeadlineExceeded {
        /// Operation that was being waited on.
        operation: String,
    },
    /// Raised for failures the adapter cannot classify.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VolumeError {
    /// Builds a [`VolumeError::NotFound`] for a volume identifier.
    #[must_use]
    pub fn volume_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: format!("volume {id}"),
        }
    }

    /// Returns the class used for retry decisions and status mapping.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Invalid(_) => ErrorClass::Invalid,
            Self::RateLimited(_) => ErrorClass::RateLimited,
            Self::Transient(_) => ErrorClass::Transient,
            Self::FailedPrecondition(_) => ErrorClass::FailedPrecondition,
            Self::Exhausted { .. } => ErrorClass::Exhausted,
            Self::DeadlineExceeded { .. } => ErrorClass::DeadlineExceeded,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Returns `true` when the error means the resource is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
