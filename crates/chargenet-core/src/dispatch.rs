//! Dispatch table
//!
//! Static action → handler map consulted for every request addressed to this node.
//! A handler receives the parsed payload and returns the response payload; the table
//! turns the result into the reply envelope, mapping failures onto request errors so
//! that a misbehaving handler never takes the connection down.

use core::future::Future;
use core::marker::PhantomData;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::envelope::{Action, BinaryResponse, Envelope, ErrorInfo, JsonResponse};
use crate::errors::{ChargenetError, FormationError, Result};
use crate::outcome::{ErrorCode, ResultCode};
use crate::types::{NetworkPath, NodeId, RequestId};

// ----------------------------------------------------------------------------
// Handler Interface
// ----------------------------------------------------------------------------

/// Request or response body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Payload of a request envelope
    pub fn of(envelope: &Envelope) -> Option<Payload> {
        match envelope {
            Envelope::JsonRequest(m) => Some(Payload::Json(m.payload.clone())),
            Envelope::BinaryRequest(m) => Some(Payload::Binary(m.payload.clone())),
            _ => None,
        }
    }
}

/// Who asked, and how the request got here
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub action: Action,
    /// Node the reply is addressed to
    pub origin: NodeId,
    pub network_path: NetworkPath,
}

/// Application handler for one action
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Payload) -> Result<Payload>;
}

/// Handler built from a closure over raw payloads
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure taking the raw payload
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Payload) -> Result<Payload> {
        (self.f)(ctx, payload).await
    }
}

/// Handler that parses a JSON payload into `Req` and serializes `Resp`
pub struct TypedHandler<Req, Resp, F> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

/// Wrap a closure over typed request/response bodies
///
/// A payload that does not parse as `Req` is answered with a formation violation
/// without calling the closure.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Payload) -> Result<Payload> {
        let value = match payload {
            Payload::Json(value) => value,
            Payload::Binary(_) => {
                return Err(FormationError::InvalidPayload {
                    action: ctx.action.to_string(),
                    reason: "expected a JSON payload".into(),
                }
                .into())
            }
        };
        let request: Req =
            serde_json::from_value(value).map_err(|e| FormationError::InvalidPayload {
                action: ctx.action.to_string(),
                reason: e.to_string(),
            })?;
        let response = (self.f)(ctx, request).await?;
        Ok(Payload::Json(serde_json::to_value(response)?))
    }
}

// ----------------------------------------------------------------------------
// Dispatch Table
// ----------------------------------------------------------------------------

/// Action → handler registry, populated at startup
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced
    pub fn register<H: Handler + 'static>(
        &mut self,
        action: Action,
        handler: H,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers
            .insert(action.as_str().to_string(), Arc::new(handler))
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered actions, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.keys().cloned().collect();
        actions.sort();
        actions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `request` and build the (unsigned) reply
    ///
    /// `local` is this node, `reply_to` the node the reply is addressed to.
    pub async fn dispatch(&self, local: &NodeId, reply_to: NodeId, request: &Envelope) -> Envelope {
        let (action, payload) = match (request.action(), Payload::of(request)) {
            (Some(action), Some(payload)) => (action.clone(), payload),
            _ => {
                return request.error_reply(
                    reply_to,
                    local.clone(),
                    ErrorInfo::new(
                        ErrorCode::MessageTypeNotSupported,
                        "only requests can be dispatched",
                    ),
                )
            }
        };

        let handler = match self.handlers.get(action.as_str()) {
            Some(handler) => Arc::clone(handler),
            None => {
                debug!(request_id = %request.request_id(), %action, "No handler registered");
                return request.error_reply(
                    reply_to,
                    local.clone(),
                    ErrorInfo::new(
                        ErrorCode::NotImplemented,
                        format!("Unknown action {}", action),
                    ),
                );
            }
        };

        let ctx = RequestContext {
            request_id: request.request_id().clone(),
            action: action.clone(),
            origin: reply_to.clone(),
            network_path: request.network_path().clone(),
        };

        let result = AssertUnwindSafe(handler.handle(ctx, payload))
            .catch_unwind()
            .await;

        let header = request.header().reply(reply_to.clone(), local.clone());
        match result {
            Ok(Ok(Payload::Json(payload))) if !payload.is_object() => {
                warn!(request_id = %request.request_id(), %action, "Handler returned a non-object payload");
                request.error_reply(
                    reply_to,
                    local.clone(),
                    ErrorInfo::new(ErrorCode::InternalError, "handler returned a non-object payload"),
                )
            }
            Ok(Ok(Payload::Json(payload))) => JsonResponse {
                header,
                payload,
                result: ResultCode::Ok,
            }
            .into(),
            Ok(Ok(Payload::Binary(payload))) => BinaryResponse {
                header,
                payload,
                result: ResultCode::Ok,
            }
            .into(),
            Ok(Err(e)) => {
                warn!(request_id = %request.request_id(), %action, error = %e, "Handler failed");
                request.error_reply(reply_to, local.clone(), handler_error_info(&e))
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                error!(request_id = %request.request_id(), %action, %reason, "Handler panicked");
                request.error_reply(
                    reply_to,
                    local.clone(),
                    ErrorInfo::new(ErrorCode::InternalError, format!("handler panicked: {}", reason)),
                )
            }
        }
    }
}

fn handler_error_info(err: &ChargenetError) -> ErrorInfo {
    let code = match err {
        ChargenetError::Formation(_) => ErrorCode::FormationViolation,
        ChargenetError::Signing(_) => ErrorCode::SecurityError,
        _ => ErrorCode::InternalError,
    };
    ErrorInfo::new(code, err.to_string())
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EnvelopeCodec;
    use crate::envelope::{BinaryRequest, JsonRequest};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Boot {
        reason: String,
    }

    #[derive(Serialize)]
    struct BootReply {
        status: &'static str,
        reason: String,
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn request(action: &str, payload: Value) -> Envelope {
        JsonRequest::new(
            RequestId::new("7").unwrap(),
            node("B"),
            Action::new(action).unwrap(),
            payload,
        )
        .into()
    }

    fn table() -> DispatchTable {
        let mut table = DispatchTable::new();
        table.register(
            Action::new("BootNotification").unwrap(),
            typed_handler(|_ctx, boot: Boot| async move {
                Ok(BootReply {
                    status: "Accepted",
                    reason: boot.reason,
                })
            }),
        );
        table.register(
            Action::new("Fail").unwrap(),
            handler_fn(|_ctx, _payload| async move {
                Err::<Payload, _>(ChargenetError::handler("database offline"))
            }),
        );
        table.register(
            Action::new("Panic").unwrap(),
            handler_fn(|_ctx, _payload| async move {
                if true {
                    panic!("boom");
                }
                Ok(Payload::Json(Value::Null))
            }),
        );
        table.register(
            Action::new("Nothing").unwrap(),
            handler_fn(|_ctx, _payload| async move { Ok(Payload::Json(Value::Null)) }),
        );
        table.register(
            Action::new("Echo").unwrap(),
            handler_fn(|_ctx, payload| async move { Ok(payload) }),
        );
        table
    }

    fn error_code(reply: &Envelope) -> Option<ErrorCode> {
        match reply {
            Envelope::JsonRequestError(m) => Some(m.error.code.clone()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        let reply = table()
            .dispatch(&node("B"), node("A"), &request("BootNotification", json!({"reason": "PowerUp"})))
            .await;
        let Envelope::JsonResponse(response) = reply else {
            panic!("expected response, got {:?}", reply);
        };
        assert_eq!(response.header.request_id.as_str(), "7");
        assert_eq!(response.header.destination, node("A"));
        assert_eq!(response.payload, json!({"status": "Accepted", "reason": "PowerUp"}));
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_implemented() {
        let reply = table()
            .dispatch(&node("B"), node("A"), &request("Ping", json!({})))
            .await;
        assert_eq!(reply.request_id().as_str(), "7");
        assert_eq!(error_code(&reply), Some(ErrorCode::NotImplemented));
    }

    #[tokio::test]
    async fn test_bad_payload_is_formation_violation() {
        let reply = table()
            .dispatch(&node("B"), node("A"), &request("BootNotification", json!({"reason": 5})))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::FormationViolation));
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_internal_errors() {
        let table = table();
        let reply = table
            .dispatch(&node("B"), node("A"), &request("Fail", json!({})))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InternalError));

        let reply = table
            .dispatch(&node("B"), node("A"), &request("Panic", json!({})))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InternalError));
        let Envelope::JsonRequestError(m) = reply else {
            unreachable!()
        };
        assert!(m.error.description.contains("boom"));
    }

    #[tokio::test]
    async fn test_non_object_result_is_internal_error() {
        let reply = table()
            .dispatch(&node("B"), node("A"), &request("Nothing", json!({})))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InternalError));
        assert!(EnvelopeCodec::encode(&reply).is_ok());
    }

    #[tokio::test]
    async fn test_binary_payload_echo() {
        let request: Envelope = BinaryRequest::new(
            RequestId::new("b1").unwrap(),
            node("B"),
            Action::new("Echo").unwrap(),
            vec![1, 2, 3],
        )
        .into();
        let reply = table().dispatch(&node("B"), node("A"), &request).await;
        let Envelope::BinaryResponse(response) = reply else {
            panic!("expected binary response");
        };
        assert_eq!(response.payload, vec![1, 2, 3]);
        assert_eq!(table().actions().len(), 4);
    }
}
