use std::net::SocketAddr;

use nyuki_protocol::Method;
use thiserror::Error;

/// Errors raised while building or running the HTTP surface.
#[derive(Debug, Error)]
pub enum ExposerError {
    #[error("malformed endpoint `{endpoint}`: {reason}")]
    InvalidTemplate { endpoint: String, reason: String },
    #[error("capability name must not be empty")]
    UnnamedCapability,
    #[error("capability `{0}` declares no method")]
    NoMethods(String),
    #[error("capability `{0}` is declared twice")]
    DuplicateCapability(String),
    #[error("{method} {path} is declared by both `{first}` and `{second}`")]
    DuplicateRoute {
        method: Method,
        path: String,
        first: String,
        second: String,
    },
    #[error("capabilities are already exposed")]
    AlreadyExposed,
    #[error("no capability exposed yet")]
    NotExposed,
    #[error("api server already listening on {0}")]
    AlreadyRunning(SocketAddr),
    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid dispatch request: {0}")]
    Dispatch(String),
}

/// Failure of a capability handler.
///
/// `NotFound` answers 404 and is not reported; anything else is reported to
/// the exception hook and answers 500.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CapabilityError {
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Self::Failed(error.into())
    }
}
