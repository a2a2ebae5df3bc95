//! Error types for the chargenet protocol substrate
//!
//! This module contains all error types used throughout the core crate: envelope
//! formation errors, signing errors, transport errors, configuration errors, and the
//! main `ChargenetError` type that unifies them all.
//!
//! Expected protocol conditions (malformed frames, bad signatures, filtered requests)
//! are converted into an [`Outcome`](crate::outcome::Outcome) at component boundaries;
//! these error types describe *why*.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Reasons an inbound frame or payload could not be turned into a well-formed message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormationError {
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Invalid JSON: {reason}")]
    InvalidJson { reason: String },
    #[error("Unknown message type id: {message_type}")]
    UnknownMessageType { message_type: u64 },
    #[error("Message type {message_type} cannot be carried in a {frame} frame")]
    WrongFrameKind {
        message_type: u8,
        frame: &'static str,
    },
    #[error("Missing field: {field}")]
    MissingField { field: &'static str },
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Truncated frame while reading {field}")]
    Truncated { field: &'static str },
    #[error("Unexpected trailing data: {count} bytes")]
    TrailingBytes { count: usize },
    #[error("Invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },
    #[error("Routing loop: {node} already present in network path")]
    RoutingLoop { node: String },
}

impl FormationError {
    /// Create an invalid field error with a reason
    pub fn invalid_field<T: Into<String>>(field: &'static str, reason: T) -> Self {
        FormationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Specific signing and verification error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("Signer {key_id} failed: {reason}")]
    SignerFailed { key_id: String, reason: String },
    #[error("No trusted key for key id {key_id}")]
    UnknownKey { key_id: String },
    #[error("Signature from {key_id} does not validate")]
    InvalidSignature { key_id: String },
    #[error("Message carries no signature but one is required")]
    MissingSignature,
    #[error("Unsupported signature algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
    #[error("Invalid key material: {reason}")]
    InvalidKey { reason: String },
    #[error("Canonical encoding failed: {reason}")]
    Canonicalization { reason: String },
}

/// Specific transport error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {remote} closed")]
    ConnectionClosed { remote: String },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Send lock not acquired within {duration_ms}ms")]
    SendLockTimeout { duration_ms: u64 },
    #[error("No route to {destination}")]
    NoRoute { destination: String },
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for the chargenet substrate
#[derive(Debug, thiserror::Error)]
pub enum ChargenetError {
    #[error("Formation violation: {0}")]
    Formation(#[from] FormationError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request id {request_id} is already in flight")]
    DuplicateRequestId { request_id: String },

    #[error("Handler error: {message}")]
    Handler { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ChargenetError {
    /// Create a formation error for an invalid field
    pub fn formation<T: Into<String>>(field: &'static str, reason: T) -> Self {
        ChargenetError::Formation(FormationError::invalid_field(field, reason))
    }

    /// Create a transport send failure
    pub fn transport<T: Into<String>>(reason: T) -> Self {
        ChargenetError::Transport(TransportError::SendFailed {
            reason: reason.into(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ChargenetError::Config(ConfigError::Invalid {
            reason: reason.into(),
        })
    }

    /// Create a handler error with a message
    pub fn handler<T: Into<String>>(message: T) -> Self {
        ChargenetError::Handler {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ChargenetError>;
pub type ChargenetResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: ChargenetError = FormationError::EmptyFrame.into();
        assert!(matches!(err, ChargenetError::Formation(FormationError::EmptyFrame)));
        assert_eq!(err.to_string(), "Formation violation: Empty frame");
    }

    #[test]
    fn test_convenience_constructors() {
        let err = ChargenetError::transport("socket reset");
        assert_eq!(err.to_string(), "Transport error: Send failed: socket reset");

        let err = ChargenetError::formation("requestId", "must be a string");
        assert!(err.to_string().contains("requestId"));
    }
}
