//! Message envelopes
//!
//! The six wire-message kinds exchanged between nodes. Routing and correlation
//! metadata shared by every kind lives in [`Header`]; each kind adds only what is
//! specific to it (action and timeout budget for requests, relay result for
//! responses, error information for errors).

use core::fmt;
use core::time::Duration;
use serde_json::Value;

use crate::errors::FormationError;
use crate::outcome::{ErrorCode, Outcome, ResultCode};
use crate::types::{NetworkPath, NodeId, RequestId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Timeout budget applied to requests that do not carry one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Message Type Identifiers
// ----------------------------------------------------------------------------

/// Discriminant of a wire message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTypeId {
    Request = 2,
    Response = 3,
    RequestError = 4,
    ResponseError = 5,
}

impl MessageTypeId {
    /// Convert from raw value
    pub fn from_u64(value: u64) -> Result<Self, FormationError> {
        match value {
            2 => Ok(MessageTypeId::Request),
            3 => Ok(MessageTypeId::Response),
            4 => Ok(MessageTypeId::RequestError),
            5 => Ok(MessageTypeId::ResponseError),
            other => Err(FormationError::UnknownMessageType {
                message_type: other,
            }),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The six envelope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    JsonRequest,
    JsonResponse,
    JsonRequestError,
    JsonResponseError,
    BinaryRequest,
    BinaryResponse,
}

// ----------------------------------------------------------------------------
// Action
// ----------------------------------------------------------------------------

/// Operation name of a request (e.g. `BootNotification`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Action(String);

impl Action {
    pub fn new<T: Into<String>>(name: T) -> Result<Self, FormationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(FormationError::invalid_field("action", "must not be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(FormationError::invalid_field(
                "action",
                format!("invalid characters in {:?}", name),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Signatures
// ----------------------------------------------------------------------------

/// Algorithm a detached signature was produced with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Ed25519,
    Other(String),
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "ed25519" => SignatureAlgorithm::Ed25519,
            other => SignatureAlgorithm::Other(other.to_string()),
        }
    }
}

/// Detachable signature attached to an envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Identifies the key in the verifier's trust policy
    pub key_id: String,
    pub algorithm: SignatureAlgorithm,
    pub value: Vec<u8>,
}

impl Signature {
    pub fn new<T: Into<String>>(key_id: T, algorithm: SignatureAlgorithm, value: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm,
            value,
        }
    }
}

// ----------------------------------------------------------------------------
// Header
// ----------------------------------------------------------------------------

/// Routing and correlation metadata common to every envelope kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub request_id: RequestId,
    /// Ultimate destination of the message
    pub destination: NodeId,
    /// Hops the message traversed so far
    pub network_path: NetworkPath,
    /// Creation time at the originator
    pub timestamp: Timestamp,
    pub signatures: Vec<Signature>,
}

impl Header {
    pub fn new(request_id: RequestId, destination: NodeId) -> Self {
        Self {
            request_id,
            destination,
            network_path: NetworkPath::empty(),
            timestamp: Timestamp::now(),
            signatures: Vec::new(),
        }
    }

    /// Header of a reply: same request id, addressed to `destination`, path
    /// starting at the replying node
    pub fn reply(&self, destination: NodeId, replier: NodeId) -> Self {
        Self {
            request_id: self.request_id.clone(),
            destination,
            network_path: NetworkPath::from_origin(replier),
            timestamp: Timestamp::now(),
            signatures: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope Variants
// ----------------------------------------------------------------------------

/// Error information carried by request-error and response-error envelopes
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl ErrorInfo {
    pub fn new<T: Into<String>>(code: ErrorCode, description: T) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Error information describing a local outcome to a remote caller
    pub fn from_outcome(outcome: &Outcome) -> Self {
        Self {
            code: outcome.wire_error_code(),
            description: outcome.description.clone().unwrap_or_default(),
            details: outcome
                .details
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRequest {
    pub header: Header,
    pub action: Action,
    pub payload: Value,
    /// Remaining time budget when the message was written
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponse {
    pub header: Header,
    pub payload: Value,
    /// `Ok` unless a relay synthesized this response
    pub result: ResultCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRequestError {
    pub header: Header,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponseError {
    pub header: Header,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryRequest {
    pub header: Header,
    pub action: Action,
    pub payload: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryResponse {
    pub header: Header,
    pub payload: Vec<u8>,
    pub result: ResultCode,
}

impl JsonRequest {
    pub fn new(request_id: RequestId, destination: NodeId, action: Action, payload: Value) -> Self {
        Self {
            header: Header::new(request_id, destination),
            action,
            payload,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BinaryRequest {
    pub fn new(
        request_id: RequestId,
        destination: NodeId,
        action: Action,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: Header::new(request_id, destination),
            action,
            payload,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// Any wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    JsonRequest(JsonRequest),
    JsonResponse(JsonResponse),
    JsonRequestError(JsonRequestError),
    JsonResponseError(JsonResponseError),
    BinaryRequest(BinaryRequest),
    BinaryResponse(BinaryResponse),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::JsonRequest(_) => EnvelopeKind::JsonRequest,
            Envelope::JsonResponse(_) => EnvelopeKind::JsonResponse,
            Envelope::JsonRequestError(_) => EnvelopeKind::JsonRequestError,
            Envelope::JsonResponseError(_) => EnvelopeKind::JsonResponseError,
            Envelope::BinaryRequest(_) => EnvelopeKind::BinaryRequest,
            Envelope::BinaryResponse(_) => EnvelopeKind::BinaryResponse,
        }
    }

    pub fn message_type(&self) -> MessageTypeId {
        match self {
            Envelope::JsonRequest(_) | Envelope::BinaryRequest(_) => MessageTypeId::Request,
            Envelope::JsonResponse(_) | Envelope::BinaryResponse(_) => MessageTypeId::Response,
            Envelope::JsonRequestError(_) => MessageTypeId::RequestError,
            Envelope::JsonResponseError(_) => MessageTypeId::ResponseError,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Envelope::JsonRequest(m) => &m.header,
            Envelope::JsonResponse(m) => &m.header,
            Envelope::JsonRequestError(m) => &m.header,
            Envelope::JsonResponseError(m) => &m.header,
            Envelope::BinaryRequest(m) => &m.header,
            Envelope::BinaryResponse(m) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Envelope::JsonRequest(m) => &mut m.header,
            Envelope::JsonResponse(m) => &mut m.header,
            Envelope::JsonRequestError(m) => &mut m.header,
            Envelope::JsonResponseError(m) => &mut m.header,
            Envelope::BinaryRequest(m) => &mut m.header,
            Envelope::BinaryResponse(m) => &mut m.header,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.header().request_id
    }

    pub fn destination(&self) -> &NodeId {
        &self.header().destination
    }

    pub fn network_path(&self) -> &NetworkPath {
        &self.header().network_path
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.header().signatures
    }

    pub fn is_request(&self) -> bool {
        self.message_type() == MessageTypeId::Request
    }

    /// Responses and both error kinds resolve a pending request
    pub fn is_reply(&self) -> bool {
        !self.is_request()
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Envelope::BinaryRequest(_) | Envelope::BinaryResponse(_))
    }

    /// Action of a request
    pub fn action(&self) -> Option<&Action> {
        match self {
            Envelope::JsonRequest(m) => Some(&m.action),
            Envelope::BinaryRequest(m) => Some(&m.action),
            _ => None,
        }
    }

    /// Timeout budget of a request
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Envelope::JsonRequest(m) => Some(m.timeout),
            Envelope::BinaryRequest(m) => Some(m.timeout),
            _ => None,
        }
    }

    /// Replace the timeout budget of a request; no-op for replies
    pub fn set_timeout(&mut self, timeout: Duration) {
        match self {
            Envelope::JsonRequest(m) => m.timeout = timeout,
            Envelope::BinaryRequest(m) => m.timeout = timeout,
            _ => {}
        }
    }

    /// Append a hop to the network path
    pub fn push_hop(&mut self, hop: NodeId) {
        let header = self.header_mut();
        header.network_path = header.network_path.append(hop);
    }

    /// Outcome a caller observes when this envelope resolves its request
    pub fn reply_outcome(&self) -> Outcome {
        match self {
            Envelope::JsonResponse(m) => result_outcome(m.result),
            Envelope::BinaryResponse(m) => result_outcome(m.result),
            Envelope::JsonRequestError(m) => Outcome::from_remote_error(
                m.error.code.clone(),
                m.error.description.clone(),
                m.error.details.clone(),
            ),
            Envelope::JsonResponseError(m) => Outcome::from_remote_error(
                m.error.code.clone(),
                m.error.description.clone(),
                m.error.details.clone(),
            ),
            Envelope::JsonRequest(_) | Envelope::BinaryRequest(_) => {
                Outcome::generic_error("a request cannot resolve a pending request")
            }
        }
    }

    /// Request-error envelope answering this message
    pub fn error_reply(&self, destination: NodeId, replier: NodeId, error: ErrorInfo) -> Envelope {
        Envelope::JsonRequestError(JsonRequestError {
            header: self.header().reply(destination, replier),
            error,
        })
    }
}

fn result_outcome(result: ResultCode) -> Outcome {
    match result {
        ResultCode::Ok => Outcome::ok(),
        ResultCode::Filtered => Outcome::filtered("request filtered by a networking node"),
        other => Outcome::generic_error(format!("relay reported {}", other)),
    }
}

impl From<JsonRequest> for Envelope {
    fn from(m: JsonRequest) -> Self {
        Envelope::JsonRequest(m)
    }
}

impl From<JsonResponse> for Envelope {
    fn from(m: JsonResponse) -> Self {
        Envelope::JsonResponse(m)
    }
}

impl From<JsonRequestError> for Envelope {
    fn from(m: JsonRequestError) -> Self {
        Envelope::JsonRequestError(m)
    }
}

impl From<JsonResponseError> for Envelope {
    fn from(m: JsonResponseError) -> Self {
        Envelope::JsonResponseError(m)
    }
}

impl From<BinaryRequest> for Envelope {
    fn from(m: BinaryRequest) -> Self {
        Envelope::BinaryRequest(m)
    }
}

impl From<BinaryResponse> for Envelope {
    fn from(m: BinaryResponse) -> Self {
        Envelope::BinaryResponse(m)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
