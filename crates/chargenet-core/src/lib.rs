//! Chargenet Core Protocol Substrate
//!
//! This crate provides the message substrate shared by every participant in a
//! charging network (stations, local controllers, networking nodes, management
//! systems): identities and network paths, the six envelope kinds and their wire
//! codec, the result model, the signing boundary, the route table, the dispatch
//! table and the forwarding pipeline run by relays.
//!
//! Connection handling and request correlation live in `chargenet-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod forwarding;
pub mod outcome;
pub mod routing;
pub mod signing;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{EnvelopeCodec, Frame, DEFAULT_MAX_FRAME_SIZE, SIGNING_CONTEXT};
pub use config::{
    DefaultDecision, DispatchConfig, FilterSelection, ForwardingConfig, LateResponsePolicy,
    NodeConfig, RequestConfig, SharedNodeConfig,
};
pub use dispatch::{handler_fn, typed_handler, DispatchTable, Handler, Payload, RequestContext};
pub use envelope::{
    Action, BinaryRequest, BinaryResponse, Envelope, EnvelopeKind, ErrorInfo, Header,
    JsonRequest, JsonRequestError, JsonResponse, JsonResponseError, MessageTypeId, Signature,
    SignatureAlgorithm, DEFAULT_REQUEST_TIMEOUT,
};
pub use errors::{
    ChargenetError, ChargenetResult, ConfigError, FormationError, Result, SigningError,
    TransportError,
};
pub use forwarding::{
    filter_fn, filtered_status, ErrorReporter, FilterVerdict, ForwardingDecision,
    ForwardingObserver, ForwardingPipeline, ForwardingResult, ForwardingTable, GenericRequest,
    JsonRelayMessage, PipelineFault, PipelineStage, RejectReply, RelayContext, RelayDecision,
    RelayMessage, RelayPipeline, RequestFilter, SentNotifier, TracingErrorReporter,
};
pub use outcome::{ErrorCode, Outcome, ResultCode};
pub use routing::{RouteDecision, RouteTable};
pub use signing::{
    key_fingerprint, Ed25519Signer, Signer, SigningBoundary, SigningOutcome, TrustPolicy,
    VerificationMode,
};
pub use types::{NetworkPath, NodeId, RequestId, RequestIdGenerator, Timestamp};
