//! Errors surfaced by the dispatcher.
use std::fmt;
use std::io;

use http::StatusCode;

use crate::bucket::BucketError;
use crate::resource::{Resource, ResourceError};
use crate::transport::BoxError;

/// Payload of a 4xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub status: StatusCode,
    /// Discord JSON error code, when the body carried one.
    pub code: Option<i64>,
    pub message: String,
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = self.status.canonical_reason().unwrap_or("Unknown Status");
        match self.code {
            Some(code) => write!(f, "{}: ({}) {}", reason, code, self.message),
            None => write!(f, "{}: {}", reason, self.message),
        }
    }
}

/// Every way a dispatched request can fail.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// 400.
    #[error("{0}")]
    BadRequest(ErrorBody),
    /// 401.
    #[error("{0}")]
    Unauthorized(ErrorBody),
    /// 403.
    #[error("{0}")]
    Forbidden(ErrorBody),
    /// 404.
    #[error("{0}")]
    NotFound(ErrorBody),
    /// Any other 4xx.
    #[error("{0}")]
    Client(ErrorBody),
    /// Any 5xx.
    #[error("{status}: {message}")]
    Server { status: StatusCode, message: String },
    /// Every attempt was rate limited.
    #[error("the request failed too many times ({attempts} attempts, {resource})")]
    RetriesExhausted { resource: Box<Resource>, attempts: usize },
    /// Status outside 200..600.
    #[error("unrecognized http status {0}")]
    UnrecognizedStatus(u16),
    #[error("invalid route: {0}")]
    Route(#[from] ResourceError),
    #[error("rate limit bucket: {0}")]
    Bucket(#[from] BucketError),
    #[error("invalid header value for {name}")]
    InvalidHeader { name: &'static str },
    #[error("failed to rewind attachment: {0}")]
    Rewind(#[source] io::Error),
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("dispatcher is closed")]
    Closed,
}

impl DispatchError {
    /// True for every 4xx kind, including the specialized ones.
    pub fn is_client_error(&self) -> bool {
        self.client_body().is_some()
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// HTTP status of a client or server error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Server { status, .. } => Some(*status),
            _ => self.client_body().map(|b| b.status),
        }
    }

    /// Discord error code of a client error.
    pub fn code(&self) -> Option<i64> {
        self.client_body().and_then(|b| b.code)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Server { message, .. } => Some(message.as_str()),
            _ => self.client_body().map(|b| b.message.as_str()),
        }
    }

    /// Resource of a `RetriesExhausted` error.
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Self::RetriesExhausted { resource, .. } => Some(resource.as_ref()),
            _ => None,
        }
    }

    fn client_body(&self) -> Option<&ErrorBody> {
        match self {
            Self::BadRequest(b)
            | Self::Unauthorized(b)
            | Self::Forbidden(b)
            | Self::NotFound(b)
            | Self::Client(b) => Some(b),
            _ => None,
        }
    }
}
