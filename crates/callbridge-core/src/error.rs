//! Error types for the call bridge.
//!
//! `BridgeError` covers every failure the bridge can observe. Each variant maps
//! onto the shared status code domain through [`BridgeError::status`], which is
//! how failures cross a boundary that cannot carry a Rust error value.

use crate::buffer::AllocDomain;
use crate::fault::TransportFault;
use crate::status::StatusCode;
use thiserror::Error;

/// Main error type for the call bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Binding errors
    #[error("Cannot bind to {binding}: {message}")]
    Connection {
        binding: String,
        message: String,
        status: StatusCode,
    },

    // Call errors
    #[error("Transport fault: {0}")]
    TransportFault(TransportFault),

    #[error("Call failed with {0}")]
    Status(StatusCode),

    // Service lifecycle errors
    #[error("Registration failed with {status}: {message}")]
    Registration { status: StatusCode, message: String },

    // Application errors
    #[error("Allocation of {len} bytes failed in the {domain} domain")]
    Allocation { domain: AllocDomain, len: usize },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Encoding error: {message}")]
    Encoding { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<TransportFault> for BridgeError {
    fn from(fault: TransportFault) -> Self {
        BridgeError::TransportFault(fault)
    }
}

impl BridgeError {
    /// Build a connection error for a string binding.
    pub fn connection(
        binding: impl Into<String>,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        BridgeError::Connection {
            binding: binding.into(),
            message: message.into(),
            status,
        }
    }

    /// Convert to a status code.
    ///
    /// - Connection and registration errors carry their own code
    /// - Transport faults map 1:1 via [`TransportFault::status`]
    /// - Explicit statuses pass through unchanged
    /// - Allocation failures become `ERROR_NOT_ENOUGH_MEMORY`
    /// - Invalid arguments become `ERROR_INVALID_PARAMETER`
    /// - Encoding failures become `ERROR_NO_UNICODE_TRANSLATION`
    /// - Everything else is `ERROR_INTERNAL_ERROR`
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::Connection { status, .. } => *status,
            BridgeError::TransportFault(fault) => fault.status(),
            BridgeError::Status(status) => *status,
            BridgeError::Registration { status, .. } => *status,
            BridgeError::Allocation { .. } => StatusCode::NOT_ENOUGH_MEMORY,
            BridgeError::InvalidArgument { .. } => StatusCode::INVALID_PARAMETER,
            BridgeError::Encoding { .. } => StatusCode::NO_UNICODE_TRANSLATION,
            BridgeError::Io { .. } | BridgeError::Json { .. } | BridgeError::Runtime { .. } => {
                StatusCode::INTERNAL_ERROR
            }
        }
    }

    /// Whether the failure was raised by the transport rather than by either
    /// endpoint's own logic.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, BridgeError::TransportFault(_))
    }
}
