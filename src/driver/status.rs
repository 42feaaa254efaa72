//! Translation of domain and request errors into gRPC status codes.

use thiserror::Error;
use tonic::{Code, Status};

use crate::error::VolumeError;

/// Request rejected by controller validation before reaching the volume
/// service.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub(crate) enum RequestError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    OutOfRange(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Aborted(String),
}

impl RequestError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::InvalidArgument(format!("missing {field}"))
    }

    const fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::OutOfRange(_) => Code::OutOfRange,
            Self::NotFound(_) => Code::NotFound,
            Self::Aborted(_) => Code::Aborted,
        }
    }
}

impl From<RequestError> for Status {
    fn from(value: RequestError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

fn code_for(error: &VolumeError, conflict: Code) -> Code {
    match error {
        VolumeError::NotFound { .. } => Code::NotFound,
        VolumeError::Conflict(_) => conflict,
        VolumeError::Invalid(_) => Code::InvalidArgument,
        VolumeError::FailedPrecondition(_) => Code::FailedPrecondition,
        VolumeError::RateLimited(_) | VolumeError::Transient(_) | VolumeError::Exhausted { .. } => {
            Code::Unavailable
        }
        VolumeError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
        VolumeError::Internal(_) => Code::Internal,
    }
}

/// Status for a failed volume operation other than creation.
pub(crate) fn volume_error(error: &VolumeError) -> Status {
    Status::new(code_for(error, Code::FailedPrecondition), error.to_string())
}

/// Status for a failed creation; name conflicts become `ALREADY_EXISTS`.
pub(crate) fn create_error(error: &VolumeError) -> Status {
    Status::new(code_for(error, Code::AlreadyExists), error.to_string())
}
