//! Result/outcome model
//!
//! Every attempt to deliver, relay or answer a message concludes with an [`Outcome`]
//! carrying a closed [`ResultCode`]. Callers use it to tell peer-level protocol errors
//! (carried as an [`ErrorCode`] on the wire) apart from transport and correlation
//! failures detected locally.

use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FormationError, SigningError, TransportError};

// ----------------------------------------------------------------------------
// Result Codes
// ----------------------------------------------------------------------------

/// Closed taxonomy of how an attempt concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Timeout = 1,
    FormationViolation = 2,
    SignatureError = 3,
    Filtered = 4,
    TransportFailure = 5,
    GenericError = 6,
    Exception = 7,
    /// The caller withdrew before a reply arrived
    Cancelled = 8,
}

impl ResultCode {
    /// Convert from raw byte value
    pub fn from_u8(value: u8) -> Result<Self, FormationError> {
        match value {
            0 => Ok(ResultCode::Ok),
            1 => Ok(ResultCode::Timeout),
            2 => Ok(ResultCode::FormationViolation),
            3 => Ok(ResultCode::SignatureError),
            4 => Ok(ResultCode::Filtered),
            5 => Ok(ResultCode::TransportFailure),
            6 => Ok(ResultCode::GenericError),
            7 => Ok(ResultCode::Exception),
            8 => Ok(ResultCode::Cancelled),
            other => Err(FormationError::invalid_field(
                "result",
                format!("unknown result code {}", other),
            )),
        }
    }

    /// Convert to raw byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "Ok",
            ResultCode::Timeout => "Timeout",
            ResultCode::FormationViolation => "FormationViolation",
            ResultCode::SignatureError => "SignatureError",
            ResultCode::Filtered => "Filtered",
            ResultCode::TransportFailure => "TransportFailure",
            ResultCode::GenericError => "GenericError",
            ResultCode::Exception => "Exception",
            ResultCode::Cancelled => "Cancelled",
        }
    }

    /// Wire error code used when this result must be reported to a remote caller
    pub fn to_error_code(self) -> ErrorCode {
        match self {
            ResultCode::Timeout => ErrorCode::Timeout,
            ResultCode::FormationViolation => ErrorCode::FormationViolation,
            ResultCode::SignatureError => ErrorCode::SecurityError,
            ResultCode::Filtered => ErrorCode::Filtered,
            ResultCode::TransportFailure => ErrorCode::TransportFailure,
            ResultCode::Exception => ErrorCode::InternalError,
            ResultCode::Ok | ResultCode::GenericError | ResultCode::Cancelled => {
                ErrorCode::GenericError
            }
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultCode {
    type Err = FormationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ok" => Ok(ResultCode::Ok),
            "Timeout" => Ok(ResultCode::Timeout),
            "FormationViolation" => Ok(ResultCode::FormationViolation),
            "SignatureError" => Ok(ResultCode::SignatureError),
            "Filtered" => Ok(ResultCode::Filtered),
            "TransportFailure" => Ok(ResultCode::TransportFailure),
            "GenericError" => Ok(ResultCode::GenericError),
            "Exception" => Ok(ResultCode::Exception),
            "Cancelled" => Ok(ResultCode::Cancelled),
            other => Err(FormationError::invalid_field(
                "result",
                format!("unknown result code {}", other),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Wire Error Codes
// ----------------------------------------------------------------------------

/// Error code carried by request-error and response-error envelopes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    MessageTypeNotSupported,
    RpcFrameworkError,
    GenericError,
    Timeout,
    TransportFailure,
    Filtered,
    /// Any code this node does not know, preserved verbatim
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::TransportFailure => "TransportFailure",
            ErrorCode::Filtered => "Filtered",
            ErrorCode::Other(code) => code,
        }
    }

    /// Parse a wire code; unknown codes are kept as [`ErrorCode::Other`]
    pub fn parse(code: &str) -> Self {
        match code {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "GenericError" => ErrorCode::GenericError,
            "Timeout" => ErrorCode::Timeout,
            "TransportFailure" => ErrorCode::TransportFailure,
            "Filtered" => ErrorCode::Filtered,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    /// Result code a caller observes when a peer answers with this error
    pub fn to_result_code(&self) -> ResultCode {
        match self {
            ErrorCode::FormationViolation
            | ErrorCode::PropertyConstraintViolation
            | ErrorCode::OccurrenceConstraintViolation
            | ErrorCode::TypeConstraintViolation => ResultCode::FormationViolation,
            ErrorCode::SecurityError => ResultCode::SignatureError,
            ErrorCode::Timeout => ResultCode::Timeout,
            ErrorCode::TransportFailure => ResultCode::TransportFailure,
            ErrorCode::Filtered => ResultCode::Filtered,
            ErrorCode::InternalError => ResultCode::Exception,
            // Older peers spell it this way; kept as `Other` so it re-encodes verbatim.
            ErrorCode::Other(code) if code == "FormatViolation" => ResultCode::FormationViolation,
            _ => ResultCode::GenericError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Outcome
// ----------------------------------------------------------------------------

/// How an attempt concluded, with optional diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Result kind
    pub code: ResultCode,
    /// Peer-supplied error code when the remote answered with an error envelope
    pub error_code: Option<ErrorCode>,
    /// Human readable description
    pub description: Option<String>,
    /// Structured details
    pub details: Option<Value>,
    /// Time between sending and resolution, when measured
    pub runtime: Option<Duration>,
}

impl Outcome {
    fn with_code(code: ResultCode) -> Self {
        Self {
            code,
            error_code: None,
            description: None,
            details: None,
            runtime: None,
        }
    }

    pub fn ok() -> Self {
        Self::with_code(ResultCode::Ok)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::with_code(ResultCode::Timeout)
            .with_description(format!("no response within {}ms", after.as_millis()))
    }

    pub fn formation_violation<T: Into<String>>(description: T) -> Self {
        Self::with_code(ResultCode::FormationViolation).with_description(description)
    }

    pub fn signature_error<T: Into<String>>(description: T) -> Self {
        Self::with_code(ResultCode::SignatureError).with_description(description)
    }

    pub fn filtered<T: Into<String>>(description: T) -> Self {
        Self::with_code(ResultCode::Filtered).with_description(description)
    }

    pub fn transport_failure<T: Into<String>>(description: T) -> Self {
        Self::with_code(ResultCode::TransportFailure).with_description(description)
    }

    pub fn generic_error<T: Into<String>>(description: T) -> Self {
        Self::with_code(ResultCode::GenericError).with_description(description)
    }

    pub fn exception<T: Into<String>>(description: T) -> Self {
        Self::with_code(ResultCode::Exception).with_description(description)
    }

    pub fn cancelled() -> Self {
        Self::with_code(ResultCode::Cancelled).with_description("call cancelled by caller")
    }

    /// Outcome observed by a caller whose peer answered with an error envelope
    pub fn from_remote_error(code: ErrorCode, description: String, details: Value) -> Self {
        Self {
            code: code.to_result_code(),
            error_code: Some(code),
            description: if description.is_empty() {
                None
            } else {
                Some(description)
            },
            details: match details {
                Value::Null => None,
                Value::Object(ref map) if map.is_empty() => None,
                other => Some(other),
            },
            runtime: None,
        }
    }

    pub fn with_description<T: Into<String>>(mut self, description: T) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }

    /// Error code to put on the wire when reporting this outcome to a remote caller
    pub fn wire_error_code(&self) -> ErrorCode {
        self.error_code
            .clone()
            .unwrap_or_else(|| self.code.to_error_code())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.code, description),
            None => write!(f, "{}", self.code),
        }
    }
}

impl From<FormationError> for Outcome {
    fn from(err: FormationError) -> Self {
        Outcome::formation_violation(err.to_string())
    }
}

impl From<SigningError> for Outcome {
    fn from(err: SigningError) -> Self {
        Outcome::signature_error(err.to_string())
    }
}

impl From<TransportError> for Outcome {
    fn from(err: TransportError) -> Self {
        Outcome::transport_failure(err.to_string())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
