//! Error types for the gateway

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Not attempted: {0}")]
    NotAttempted(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Could not connect: {0}")]
    CouldNotConnect(String),

    #[error("Cannot resolve URI {uri}: {source}")]
    UnresolvableUri {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error type reported in a DSML errorResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    NotAttempted,
    CouldNotConnect,
    MalformedRequest,
    GatewayInternalError,
    AuthenticationFailed,
    #[serde(rename = "unresolvableURI")]
    UnresolvableUri,
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            GatewayError::MalformedRequest(_) => ErrorType::MalformedRequest,
            GatewayError::NotAttempted(_) => ErrorType::NotAttempted,
            GatewayError::AuthenticationFailed(_) => ErrorType::AuthenticationFailed,
            GatewayError::CouldNotConnect(_) => ErrorType::CouldNotConnect,
            GatewayError::UnresolvableUri { .. } => ErrorType::UnresolvableUri,
            GatewayError::Internal(_) => ErrorType::GatewayInternalError,
        }
    }

    /// Transport failures leave the connection unusable for the rest of the batch.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::CouldNotConnect(_))
    }
}
