//! Forwarding pipeline
//!
//! A relay runs every request that is not addressed to it through the pipeline
//! registered for its action. One pass:
//!
//! 1. parse the payload into the typed request (failure rejects with a formation
//!    violation)
//! 2. tell observers the request was received
//! 3. run all filters concurrently and pick one authoritative verdict
//! 4. synthesize a "filtered" response for rejects that did not bring one
//! 5. hand a rewritten request to the caller for re-encoding
//! 6. tell observers the verdict
//! 7. for forwarded requests, arm a notification fired once the transmission
//!    outcome is known
//!
//! Observers and filters run as independent tasks. Errors, panics and timeouts
//! inside them go to the [`ErrorReporter`] and count as "no contribution"; they
//! never abort the pass.

use core::cmp::Reverse;
use core::fmt;
use core::future::Future;
use core::time::Duration;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{DefaultDecision, FilterSelection, ForwardingConfig};
use crate::dispatch::{panic_message, Payload};
use crate::envelope::{Action, ErrorInfo};
use crate::errors::{ChargenetError, FormationError, Result};
use crate::outcome::{ErrorCode, Outcome, ResultCode};
use crate::types::{NetworkPath, NodeId, RequestId};

// ----------------------------------------------------------------------------
// Relayed Messages
// ----------------------------------------------------------------------------

/// A request type a relay knows how to inspect
pub trait RelayMessage: Clone + Send + Sync + 'static {
    type Response: Send + Sync + 'static;

    fn parse(action: &Action, payload: Payload) -> core::result::Result<Self, FormationError>;

    fn to_payload(&self) -> core::result::Result<Payload, FormationError>;

    fn response_payload(response: &Self::Response) -> core::result::Result<Payload, FormationError>;

    /// Standard response of this message type when a relay filtered it
    fn filtered(&self, reason: &str) -> Self::Response;
}

/// JSON request types get [`RelayMessage`] through serde
pub trait JsonRelayMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Response: Serialize + Send + Sync + 'static;

    fn filtered(&self, reason: &str) -> Self::Response;
}

impl<T: JsonRelayMessage> RelayMessage for T {
    type Response = <T as JsonRelayMessage>::Response;

    fn parse(action: &Action, payload: Payload) -> core::result::Result<Self, FormationError> {
        match payload {
            Payload::Json(value) => {
                serde_json::from_value(value).map_err(|e| FormationError::InvalidPayload {
                    action: action.to_string(),
                    reason: e.to_string(),
                })
            }
            Payload::Binary(_) => Err(FormationError::InvalidPayload {
                action: action.to_string(),
                reason: "expected a JSON payload".into(),
            }),
        }
    }

    fn to_payload(&self) -> core::result::Result<Payload, FormationError> {
        serde_json::to_value(self)
            .map(Payload::Json)
            .map_err(|e| FormationError::invalid_field("payload", e.to_string()))
    }

    fn response_payload(
        response: &<T as JsonRelayMessage>::Response,
    ) -> core::result::Result<Payload, FormationError> {
        serde_json::to_value(response)
            .map(Payload::Json)
            .map_err(|e| FormationError::invalid_field("payload", e.to_string()))
    }

    fn filtered(&self, reason: &str) -> <T as JsonRelayMessage>::Response {
        JsonRelayMessage::filtered(self, reason)
    }
}

/// Status body used by filtered responses
pub fn filtered_status(reason: &str) -> Value {
    json!({
        "status": "Rejected",
        "statusInfo": {
            "reasonCode": "Filtered",
            "additionalInfo": reason,
        }
    })
}

/// Any request, uninterpreted
///
/// Backs the pipeline used for actions without a typed one.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericRequest(pub Payload);

impl RelayMessage for GenericRequest {
    type Response = Payload;

    fn parse(_action: &Action, payload: Payload) -> core::result::Result<Self, FormationError> {
        Ok(GenericRequest(payload))
    }

    fn to_payload(&self) -> core::result::Result<Payload, FormationError> {
        Ok(self.0.clone())
    }

    fn response_payload(response: &Payload) -> core::result::Result<Payload, FormationError> {
        Ok(response.clone())
    }

    fn filtered(&self, reason: &str) -> Payload {
        match self.0 {
            Payload::Json(_) => Payload::Json(filtered_status(reason)),
            Payload::Binary(_) => Payload::Binary(Vec::new()),
        }
    }
}

// ----------------------------------------------------------------------------
// Decisions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardingResult {
    /// Relay unchanged
    Forward,
    /// Answer upstream, do not relay
    Reject,
    /// Relay a rewritten request
    Replace,
}

impl ForwardingResult {
    fn severity(self) -> u8 {
        match self {
            ForwardingResult::Forward => 0,
            ForwardingResult::Replace => 1,
            ForwardingResult::Reject => 2,
        }
    }
}

/// What one filter thinks should happen
#[derive(Debug, Clone)]
pub enum FilterVerdict<R: RelayMessage> {
    Forward,
    Reject {
        response: Option<R::Response>,
        message: Option<String>,
    },
    Replace(R),
}

impl<R: RelayMessage> FilterVerdict<R> {
    /// Reject and let the pipeline synthesize the filtered response
    pub fn reject() -> Self {
        FilterVerdict::Reject {
            response: None,
            message: None,
        }
    }

    pub fn reject_with_message<T: Into<String>>(message: T) -> Self {
        FilterVerdict::Reject {
            response: None,
            message: Some(message.into()),
        }
    }

    pub fn result(&self) -> ForwardingResult {
        match self {
            FilterVerdict::Forward => ForwardingResult::Forward,
            FilterVerdict::Reject { .. } => ForwardingResult::Reject,
            FilterVerdict::Replace(_) => ForwardingResult::Replace,
        }
    }
}

/// Deferred notification fired once the outcome of relaying is known
pub struct SentNotifier {
    notify: Box<dyn FnOnce(Outcome) -> BoxFuture<'static, ()> + Send>,
}

impl SentNotifier {
    pub fn new<F>(notify: F) -> Self
    where
        F: FnOnce(Outcome) -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            notify: Box::new(notify),
        }
    }

    pub async fn notify(self, outcome: Outcome) {
        (self.notify)(outcome).await
    }
}

impl fmt::Debug for SentNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SentNotifier")
    }
}

/// Authoritative outcome of one pipeline pass
#[derive(Debug)]
pub struct ForwardingDecision<R: RelayMessage> {
    pub request: R,
    pub result: ForwardingResult,
    /// Set when `result` is Reject
    pub reject_response: Option<R::Response>,
    pub reject_message: Option<String>,
    /// Set when `result` is Replace
    pub replacement: Option<R>,
    pub on_sent: Option<SentNotifier>,
}

impl<R: RelayMessage> ForwardingDecision<R> {
    pub fn is_reject(&self) -> bool {
        self.result == ForwardingResult::Reject
    }
}

// ----------------------------------------------------------------------------
// Collaborators
// ----------------------------------------------------------------------------

/// Facts about the relay step being decided
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: RequestId,
    pub action: Action,
    /// This node
    pub relay: NodeId,
    pub previous_hop: NodeId,
    pub next_hop: NodeId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
}

/// Policy hook deciding the fate of a relayed request
///
/// Returning `Ok(None)` abstains.
#[async_trait]
pub trait RequestFilter<R: RelayMessage>: Send + Sync {
    async fn filter(&self, ctx: &RelayContext, request: &R) -> Result<Option<FilterVerdict<R>>>;
}

/// Filter built from a synchronous closure
pub struct FnFilter<F> {
    f: F,
}

pub fn filter_fn<R, F>(f: F) -> FnFilter<F>
where
    R: RelayMessage,
    F: Fn(&RelayContext, &R) -> Option<FilterVerdict<R>> + Send + Sync + 'static,
{
    FnFilter { f }
}

#[async_trait]
impl<R, F> RequestFilter<R> for FnFilter<F>
where
    R: RelayMessage,
    F: Fn(&RelayContext, &R) -> Option<FilterVerdict<R>> + Send + Sync + 'static,
{
    async fn filter(&self, ctx: &RelayContext, request: &R) -> Result<Option<FilterVerdict<R>>> {
        Ok((self.f)(ctx, request))
    }
}

/// Receives the pipeline's events for one request type
#[async_trait]
pub trait ForwardingObserver<R: RelayMessage>: Send + Sync {
    async fn on_received(&self, _ctx: &RelayContext, _request: &R) -> Result<()> {
        Ok(())
    }

    async fn on_filtered(
        &self,
        _ctx: &RelayContext,
        _request: &R,
        _result: ForwardingResult,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_sent(&self, _ctx: &RelayContext, _request: &R, _outcome: &Outcome) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Filter,
    Filtered,
    Sent,
    Encode,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Received => "received",
            PipelineStage::Filter => "filter",
            PipelineStage::Filtered => "filtered",
            PipelineStage::Sent => "sent",
            PipelineStage::Encode => "encode",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum FaultKind {
    Failed(ChargenetError),
    Panicked(String),
    TimedOut(Duration),
}

/// A contribution that went wrong inside the pipeline
#[derive(Debug)]
pub struct PipelineFault {
    pub request_id: RequestId,
    pub action: Action,
    pub stage: PipelineStage,
    /// Registration index of the observer or filter, when attributable
    pub index: Option<usize>,
    pub kind: FaultKind,
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FaultKind::Failed(e) => write!(f, "{} stage failed: {}", self.stage, e),
            FaultKind::Panicked(reason) => write!(f, "{} stage panicked: {}", self.stage, reason),
            FaultKind::TimedOut(after) => {
                write!(f, "{} stage timed out after {}ms", self.stage, after.as_millis())
            }
        }
    }
}

/// Sink for faults raised by observers and filters
pub trait ErrorReporter: Send + Sync {
    fn report(&self, fault: &PipelineFault);
}

/// Reports faults as `tracing` warnings
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, fault: &PipelineFault) {
        warn!(
            request_id = %fault.request_id,
            action = %fault.action,
            stage = %fault.stage,
            index = ?fault.index,
            "{}",
            fault
        );
    }
}

// ----------------------------------------------------------------------------
// Fan-out
// ----------------------------------------------------------------------------

type Contribution<T> = (usize, core::result::Result<Result<T>, String>);

fn spawn_guarded<T, Fut>(set: &mut JoinSet<Contribution<T>>, index: usize, fut: Fut)
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    set.spawn(async move {
        let result = AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .map_err(|panic| panic_message(&*panic));
        (index, result)
    });
}

struct FanOut {
    ctx: Arc<RelayContext>,
    reporter: Arc<dyn ErrorReporter>,
    stage_timeout: Duration,
}

impl FanOut {
    fn report(&self, stage: PipelineStage, index: Option<usize>, kind: FaultKind) {
        self.reporter.report(&PipelineFault {
            request_id: self.ctx.request_id.clone(),
            action: self.ctx.action.clone(),
            stage,
            index,
            kind,
        });
    }

    /// Run observer futures to completion (or the stage deadline)
    async fn observers(&self, stage: PipelineStage, futures: Vec<BoxFuture<'static, Result<()>>>) {
        if futures.is_empty() {
            return;
        }
        let mut set = JoinSet::new();
        for (index, fut) in futures.into_iter().enumerate() {
            spawn_guarded(&mut set, index, fut);
        }
        let deadline = Instant::now() + self.stage_timeout;
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Err(_) => {
                    self.report(stage, None, FaultKind::TimedOut(self.stage_timeout));
                    set.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(join_error))) => {
                    self.report(stage, None, FaultKind::Panicked(join_error.to_string()));
                }
                Ok(Some(Ok((_, Ok(Ok(())))))) => {}
                Ok(Some(Ok((index, Ok(Err(e)))))) => {
                    self.report(stage, Some(index), FaultKind::Failed(e));
                }
                Ok(Some(Ok((index, Err(panic))))) => {
                    self.report(stage, Some(index), FaultKind::Panicked(panic));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Typed Pipeline
// ----------------------------------------------------------------------------

/// Forwarding pipeline for one request type
pub struct ForwardingPipeline<R: RelayMessage> {
    filters: Vec<Arc<dyn RequestFilter<R>>>,
    observers: Vec<Arc<dyn ForwardingObserver<R>>>,
    reporter: Arc<dyn ErrorReporter>,
    default_decision: DefaultDecision,
    selection: FilterSelection,
    stage_timeout: Duration,
}

impl<R: RelayMessage> ForwardingPipeline<R> {
    pub fn new(config: &ForwardingConfig) -> Self {
        Self {
            filters: Vec::new(),
            observers: Vec::new(),
            reporter: Arc::new(TracingErrorReporter),
            default_decision: config.default_decision,
            selection: config.filter_selection,
            stage_timeout: config.stage_timeout,
        }
    }

    pub fn with_filter<F: RequestFilter<R> + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn with_observer<O: ForwardingObserver<R> + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Register an observer that is also held elsewhere
    pub fn with_shared_observer(mut self, observer: Arc<dyn ForwardingObserver<R>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_default_decision(mut self, decision: DefaultDecision) -> Self {
        self.default_decision = decision;
        self
    }

    pub fn with_selection(mut self, selection: FilterSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Run one pass over a relayed request
    pub async fn process(
        &self,
        ctx: RelayContext,
        payload: Payload,
    ) -> core::result::Result<ForwardingDecision<R>, FormationError> {
        let request = R::parse(&ctx.action, payload)?;
        let fan_out = FanOut {
            ctx: Arc::new(ctx),
            reporter: Arc::clone(&self.reporter),
            stage_timeout: self.stage_timeout,
        };

        // Received
        let futures = self
            .observers
            .iter()
            .map(|observer| {
                let observer = Arc::clone(observer);
                let ctx = Arc::clone(&fan_out.ctx);
                let request = request.clone();
                async move { observer.on_received(&ctx, &request).await }.boxed()
            })
            .collect();
        fan_out.observers(PipelineStage::Received, futures).await;

        // Filter
        let verdict = match self.select_verdict(&fan_out, &request).await {
            Some(verdict) => verdict,
            None => match self.default_decision {
                DefaultDecision::Forward => FilterVerdict::Forward,
                DefaultDecision::Reject => FilterVerdict::reject(),
            },
        };

        let mut decision = ForwardingDecision {
            result: verdict.result(),
            request,
            reject_response: None,
            reject_message: None,
            replacement: None,
            on_sent: None,
        };
        match verdict {
            FilterVerdict::Forward => {}
            FilterVerdict::Reject { response, message } => {
                let message = message.unwrap_or_else(|| {
                    format!(
                        "{} request {} filtered by {}",
                        fan_out.ctx.action, fan_out.ctx.request_id, fan_out.ctx.relay
                    )
                });
                let response = match response {
                    Some(response) => response,
                    None => decision.request.filtered(&message),
                };
                info!(
                    request_id = %fan_out.ctx.request_id,
                    action = %fan_out.ctx.action,
                    "{}",
                    message
                );
                decision.reject_response = Some(response);
                decision.reject_message = Some(message);
            }
            FilterVerdict::Replace(replacement) => {
                decision.replacement = Some(replacement);
            }
        }

        // Filtered
        let futures = self
            .observers
            .iter()
            .map(|observer| {
                let observer = Arc::clone(observer);
                let ctx = Arc::clone(&fan_out.ctx);
                let request = decision.request.clone();
                let result = decision.result;
                async move { observer.on_filtered(&ctx, &request, result).await }.boxed()
            })
            .collect();
        fan_out.observers(PipelineStage::Filtered, futures).await;
        debug!(
            request_id = %fan_out.ctx.request_id,
            action = %fan_out.ctx.action,
            result = ?decision.result,
            "Forwarding decision"
        );

        // Sent
        if decision.result != ForwardingResult::Reject && !self.observers.is_empty() {
            let observers = self.observers.clone();
            let sent_request = decision
                .replacement
                .clone()
                .unwrap_or_else(|| decision.request.clone());
            decision.on_sent = Some(SentNotifier::new(move |outcome: Outcome| {
                async move {
                    let outcome = Arc::new(outcome);
                    let futures = observers
                        .into_iter()
                        .map(|observer| {
                            let ctx = Arc::clone(&fan_out.ctx);
                            let request = sent_request.clone();
                            let outcome = Arc::clone(&outcome);
                            async move { observer.on_sent(&ctx, &request, &outcome).await }.boxed()
                        })
                        .collect();
                    fan_out.observers(PipelineStage::Sent, futures).await;
                }
                .boxed()
            }));
        }

        Ok(decision)
    }

    /// Run all filters and pick the authoritative verdict
    async fn select_verdict(&self, fan_out: &FanOut, request: &R) -> Option<FilterVerdict<R>> {
        if self.filters.is_empty() {
            return None;
        }

        let mut set = JoinSet::new();
        for (index, filter) in self.filters.iter().enumerate() {
            let filter = Arc::clone(filter);
            let ctx = Arc::clone(&fan_out.ctx);
            let request = request.clone();
            spawn_guarded(&mut set, index, async move {
                filter.filter(&ctx, &request).await
            });
        }

        let deadline = Instant::now() + self.stage_timeout;
        let mut verdicts: Vec<(usize, FilterVerdict<R>)> = Vec::new();
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Err(_) => {
                    fan_out.report(
                        PipelineStage::Filter,
                        None,
                        FaultKind::TimedOut(self.stage_timeout),
                    );
                    set.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(join_error))) => {
                    fan_out.report(
                        PipelineStage::Filter,
                        None,
                        FaultKind::Panicked(join_error.to_string()),
                    );
                }
                Ok(Some(Ok((index, outcome)))) => match outcome {
                    Ok(Ok(Some(verdict))) => {
                        if self.selection == FilterSelection::FirstCompleted {
                            set.abort_all();
                            return Some(verdict);
                        }
                        verdicts.push((index, verdict));
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        fan_out.report(PipelineStage::Filter, Some(index), FaultKind::Failed(e))
                    }
                    Err(panic) => fan_out.report(
                        PipelineStage::Filter,
                        Some(index),
                        FaultKind::Panicked(panic),
                    ),
                },
            }
        }

        let chosen = match self.selection {
            FilterSelection::FirstCompleted => None,
            FilterSelection::RegistrationOrder => {
                verdicts.into_iter().min_by_key(|(index, _)| *index)
            }
            FilterSelection::MostRestrictive => verdicts
                .into_iter()
                .max_by_key(|(index, verdict)| (verdict.result().severity(), Reverse(*index))),
        };
        chosen.map(|(_, verdict)| verdict)
    }
}

// ----------------------------------------------------------------------------
// Erased Pipeline
// ----------------------------------------------------------------------------

/// Reply a relay sends upstream instead of relaying
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReply {
    Response { payload: Payload, result: ResultCode },
    Error(ErrorInfo),
}

/// Type-erased decision the node acts on
#[derive(Debug)]
pub struct RelayDecision {
    pub result: ForwardingResult,
    /// Rewritten payload for Replace; Forward relays the original envelope
    pub outbound: Option<Payload>,
    /// Set for Reject
    pub reject: Option<RejectReply>,
    pub on_sent: Option<SentNotifier>,
}

impl RelayDecision {
    pub fn forward() -> Self {
        Self {
            result: ForwardingResult::Forward,
            outbound: None,
            reject: None,
            on_sent: None,
        }
    }

    pub fn reject(reply: RejectReply) -> Self {
        Self {
            result: ForwardingResult::Reject,
            outbound: None,
            reject: Some(reply),
            on_sent: None,
        }
    }
}

/// Pipeline as seen by the node, independent of the request type
#[async_trait]
pub trait RelayPipeline: Send + Sync {
    async fn evaluate(&self, ctx: RelayContext, payload: Payload) -> RelayDecision;
}

#[async_trait]
impl<P: RelayPipeline + ?Sized> RelayPipeline for Arc<P> {
    async fn evaluate(&self, ctx: RelayContext, payload: Payload) -> RelayDecision {
        (**self).evaluate(ctx, payload).await
    }
}

#[async_trait]
impl<R: RelayMessage> RelayPipeline for ForwardingPipeline<R> {
    async fn evaluate(&self, ctx: RelayContext, payload: Payload) -> RelayDecision {
        let request_id = ctx.request_id.clone();
        let action = ctx.action.clone();
        let decision = match self.process(ctx, payload).await {
            Ok(decision) => decision,
            Err(e) => {
                debug!(%request_id, %action, error = %e, "Relayed payload rejected");
                return RelayDecision::reject(RejectReply::Error(ErrorInfo::new(
                    ErrorCode::FormationViolation,
                    e.to_string(),
                )));
            }
        };

        let encoded = match decision.result {
            ForwardingResult::Forward => Ok(RelayDecision::forward()),
            ForwardingResult::Replace => match &decision.replacement {
                Some(replacement) => replacement.to_payload().map(|payload| RelayDecision {
                    result: ForwardingResult::Replace,
                    outbound: Some(payload),
                    reject: None,
                    on_sent: None,
                }),
                None => Ok(RelayDecision::forward()),
            },
            ForwardingResult::Reject => match &decision.reject_response {
                Some(response) => R::response_payload(response).map(|payload| {
                    RelayDecision::reject(RejectReply::Response {
                        payload,
                        result: ResultCode::Filtered,
                    })
                }),
                None => Ok(RelayDecision::reject(RejectReply::Error(ErrorInfo::new(
                    ErrorCode::Filtered,
                    decision.reject_message.clone().unwrap_or_default(),
                )))),
            },
        };

        match encoded {
            Ok(mut relay) => {
                relay.on_sent = decision.on_sent;
                relay
            }
            Err(e) => {
                self.reporter.report(&PipelineFault {
                    request_id,
                    action,
                    stage: PipelineStage::Encode,
                    index: None,
                    kind: FaultKind::Failed(e.clone().into()),
                });
                RelayDecision::reject(RejectReply::Error(ErrorInfo::new(
                    ErrorCode::InternalError,
                    e.to_string(),
                )))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Forwarding Table
// ----------------------------------------------------------------------------

/// Action → pipeline registry with a generic fallback
pub struct ForwardingTable {
    pipelines: HashMap<String, Arc<dyn RelayPipeline>>,
    fallback: Arc<dyn RelayPipeline>,
}

impl ForwardingTable {
    /// Table whose fallback is a filterless generic pipeline under `config`
    pub fn new(config: &ForwardingConfig) -> Self {
        Self {
            pipelines: HashMap::new(),
            fallback: Arc::new(ForwardingPipeline::<GenericRequest>::new(config)),
        }
    }

    pub fn register<P: RelayPipeline + 'static>(&mut self, action: Action, pipeline: P) {
        self.pipelines
            .insert(action.as_str().to_string(), Arc::new(pipeline));
    }

    /// Replace the pipeline used for actions without a registered one
    pub fn set_fallback<P: RelayPipeline + 'static>(&mut self, pipeline: P) {
        self.fallback = Arc::new(pipeline);
    }

    pub fn has_pipeline(&self, action: &str) -> bool {
        self.pipelines.contains_key(action)
    }

    pub fn pipeline_for(&self, action: &str) -> Arc<dyn RelayPipeline> {
        self.pipelines
            .get(action)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Authorize {
        id_token: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AuthorizeReply {
        status: String,
    }

    impl JsonRelayMessage for Authorize {
        type Response = AuthorizeReply;

        fn filtered(&self, _reason: &str) -> AuthorizeReply {
            AuthorizeReply {
                status: "Blocked".into(),
            }
        }
    }

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl<R: RelayMessage> ForwardingObserver<R> for Recorder {
        async fn on_received(&self, _ctx: &RelayContext, _request: &R) -> Result<()> {
            self.push("received".into());
            Ok(())
        }

        async fn on_filtered(
            &self,
            _ctx: &RelayContext,
            _request: &R,
            result: ForwardingResult,
        ) -> Result<()> {
            self.push(format!("filtered:{:?}", result));
            Ok(())
        }

        async fn on_sent(&self, _ctx: &RelayContext, _request: &R, outcome: &Outcome) -> Result<()> {
            self.push(format!("sent:{}", outcome.code));
            Ok(())
        }
    }

    impl ErrorReporter for Recorder {
        fn report(&self, fault: &PipelineFault) {
            self.push(format!("fault:{}:{:?}", fault.stage, fault.index));
        }
    }

    struct FailingObserver;

    #[async_trait]
    impl<R: RelayMessage> ForwardingObserver<R> for FailingObserver {
        async fn on_received(&self, _ctx: &RelayContext, _request: &R) -> Result<()> {
            Err(ChargenetError::handler("observer exploded"))
        }
    }

    struct SlowFilter {
        delay: Duration,
        verdict: ForwardingResult,
    }

    #[async_trait]
    impl RequestFilter<GenericRequest> for SlowFilter {
        async fn filter(
            &self,
            _ctx: &RelayContext,
            _request: &GenericRequest,
        ) -> Result<Option<FilterVerdict<GenericRequest>>> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(match self.verdict {
                ForwardingResult::Forward => FilterVerdict::Forward,
                ForwardingResult::Reject => FilterVerdict::reject(),
                ForwardingResult::Replace => {
                    FilterVerdict::Replace(GenericRequest(Payload::Json(json!({"rewritten": true}))))
                }
            }))
        }
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn ctx(action: &str) -> RelayContext {
        RelayContext {
            request_id: RequestId::new("7").unwrap(),
            action: Action::new(action).unwrap(),
            relay: node("R"),
            previous_hop: node("A"),
            next_hop: node("B"),
            destination: node("B"),
            network_path: NetworkPath::from_origin(node("A")),
        }
    }

    fn config(default_decision: DefaultDecision, selection: FilterSelection) -> ForwardingConfig {
        ForwardingConfig {
            default_decision,
            filter_selection: selection,
            stage_timeout: Duration::from_secs(1),
        }
    }

    fn json_payload() -> Payload {
        Payload::Json(json!({"idToken": "04A2"}))
    }

    #[tokio::test]
    async fn test_default_reject_without_filters_has_response() {
        let pipeline = ForwardingPipeline::<GenericRequest>::new(&config(
            DefaultDecision::Reject,
            FilterSelection::FirstCompleted,
        ));
        let decision = pipeline.evaluate(ctx("Ping"), json_payload()).await;

        assert_eq!(decision.result, ForwardingResult::Reject);
        assert!(decision.on_sent.is_none());
        match decision.reject {
            Some(RejectReply::Response { payload, result }) => {
                assert_eq!(result, ResultCode::Filtered);
                let Payload::Json(body) = payload else {
                    panic!("expected JSON body");
                };
                assert_eq!(body["statusInfo"]["reasonCode"], "Filtered");
            }
            other => panic!("expected filtered response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_reject_uses_filtered_constructor() {
        let recorder = Recorder::default();
        let pipeline = ForwardingPipeline::<Authorize>::new(&config(
            DefaultDecision::Forward,
            FilterSelection::FirstCompleted,
        ))
        .with_filter(filter_fn(|_: &RelayContext, request: &Authorize| {
            (request.id_token == "04A2").then(FilterVerdict::reject)
        }))
        .with_observer(recorder.clone());

        let decision = pipeline
            .process(ctx("Authorize"), json_payload())
            .await
            .unwrap();
        assert!(decision.is_reject());
        assert_eq!(
            decision.reject_response,
            Some(AuthorizeReply {
                status: "Blocked".into()
            })
        );
        assert!(decision.reject_message.unwrap().contains("filtered by R"));
        assert_eq!(recorder.events(), vec!["received", "filtered:Reject"]);
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_formation_violation() {
        let pipeline = ForwardingPipeline::<Authorize>::new(&ForwardingConfig::default());
        let decision = pipeline
            .evaluate(ctx("Authorize"), Payload::Json(json!({"idToken": 42})))
            .await;
        match decision.reject {
            Some(RejectReply::Error(info)) => assert_eq!(info.code, ErrorCode::FormationViolation),
            other => panic!("expected formation violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replace_produces_rewritten_payload_and_sent_notification() {
        let recorder = Recorder::default();
        let pipeline = ForwardingPipeline::<GenericRequest>::new(&ForwardingConfig::default())
            .with_filter(SlowFilter {
                delay: Duration::from_millis(1),
                verdict: ForwardingResult::Replace,
            })
            .with_observer(recorder.clone());

        let decision = pipeline.evaluate(ctx("DataTransfer"), json_payload()).await;
        assert_eq!(decision.result, ForwardingResult::Replace);
        assert_eq!(
            decision.outbound,
            Some(Payload::Json(json!({"rewritten": true})))
        );

        let on_sent = decision.on_sent.expect("forwarded requests carry a notifier");
        on_sent.notify(Outcome::ok()).await;
        assert_eq!(
            recorder.events(),
            vec!["received", "filtered:Replace", "sent:Ok"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_completed_takes_fastest_filter() {
        let pipeline = ForwardingPipeline::<GenericRequest>::new(&config(
            DefaultDecision::Forward,
            FilterSelection::FirstCompleted,
        ))
        .with_filter(SlowFilter {
            delay: Duration::from_millis(50),
            verdict: ForwardingResult::Forward,
        })
        .with_filter(SlowFilter {
            delay: Duration::from_millis(5),
            verdict: ForwardingResult::Reject,
        });

        let decision = pipeline.evaluate(ctx("Ping"), json_payload()).await;
        assert_eq!(decision.result, ForwardingResult::Reject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_selection_policies() {
        let filters = || {
            (
                SlowFilter {
                    delay: Duration::from_millis(50),
                    verdict: ForwardingResult::Forward,
                },
                SlowFilter {
                    delay: Duration::from_millis(5),
                    verdict: ForwardingResult::Reject,
                },
            )
        };

        let (slow_forward, fast_reject) = filters();
        let in_order = ForwardingPipeline::<GenericRequest>::new(&config(
            DefaultDecision::Reject,
            FilterSelection::RegistrationOrder,
        ))
        .with_filter(slow_forward)
        .with_filter(fast_reject);
        assert_eq!(
            in_order.evaluate(ctx("Ping"), json_payload()).await.result,
            ForwardingResult::Forward
        );

        let (slow_forward, fast_reject) = filters();
        let restrictive = ForwardingPipeline::<GenericRequest>::new(&config(
            DefaultDecision::Forward,
            FilterSelection::MostRestrictive,
        ))
        .with_filter(slow_forward)
        .with_filter(fast_reject);
        assert_eq!(
            restrictive.evaluate(ctx("Ping"), json_payload()).await.result,
            ForwardingResult::Reject
        );
    }

    #[tokio::test]
    async fn test_faults_are_reported_and_ignored() {
        let recorder = Recorder::default();
        let pipeline = ForwardingPipeline::<GenericRequest>::new(&config(
            DefaultDecision::Forward,
            FilterSelection::RegistrationOrder,
        ))
        .with_filter(filter_fn(|_: &RelayContext, _: &GenericRequest| -> Option<FilterVerdict<GenericRequest>> {
            panic!("filter bug")
        }))
        .with_observer(FailingObserver)
        .with_error_reporter(Arc::new(recorder.clone()));

        let decision = pipeline.evaluate(ctx("Ping"), json_payload()).await;
        assert_eq!(decision.result, ForwardingResult::Forward);

        let events = recorder.events();
        assert!(events.contains(&"fault:received:Some(0)".to_string()));
        assert!(events.contains(&"fault:filter:Some(0)".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_filter_times_out_to_default() {
        let recorder = Recorder::default();
        let pipeline = ForwardingPipeline::<GenericRequest>::new(&config(
            DefaultDecision::Reject,
            FilterSelection::FirstCompleted,
        ))
        .with_filter(SlowFilter {
            delay: Duration::from_secs(3600),
            verdict: ForwardingResult::Forward,
        })
        .with_error_reporter(Arc::new(recorder.clone()));

        let decision = pipeline.evaluate(ctx("Ping"), json_payload()).await;
        assert_eq!(decision.result, ForwardingResult::Reject);
        assert_eq!(recorder.events(), vec!["fault:filter:None"]);
    }

    #[test]
    fn test_forwarding_table_fallback() {
        let mut table = ForwardingTable::new(&ForwardingConfig::default());
        table.register(
            Action::new("Authorize").unwrap(),
            ForwardingPipeline::<Authorize>::new(&ForwardingConfig::default()),
        );
        assert!(table.has_pipeline("Authorize"));
        assert!(!table.has_pipeline("Heartbeat"));
        let _fallback = table.pipeline_for("Heartbeat");
    }
}
