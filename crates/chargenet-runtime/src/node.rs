//! Networking node
//!
//! A [`Node`] ties the substrate together: it owns the connections to its peers, runs
//! one reader loop per connection, verifies every inbound envelope, routes requests
//! to the dispatch table or relays them through the forwarding pipeline, and signs
//! everything it writes.
//!
//! Inbound flow per frame:
//!
//! ```text
//! decode → verify → reply?  → pending table of the connection
//!                 → request → route → Local  → dispatch → sign → write back
//!                                   → Relay  → pipeline → sign → downstream call
//!                                   → Loop   → FormationViolation
//! ```

use core::time::Duration;
use std::sync::Arc;

use chargenet_core::{
    Action, BinaryRequest, BinaryResponse, DispatchTable, Envelope, EnvelopeCodec, ErrorCode,
    ErrorInfo, FormationError, ForwardingResult, ForwardingTable, Frame, Header, JsonRequest,
    JsonRequestError, JsonResponse, NetworkPath, NodeId, Outcome, Payload, RejectReply,
    RelayContext, RequestId, RequestIdGenerator, ResultCode, RouteDecision, RouteTable,
    SentNotifier, SharedNodeConfig, SigningBoundary, TransportError,
};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::builder::NodeBuilder;
use crate::connection::Connection;
use crate::correlation::{CallOptions, CallResponse};
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Node
// ----------------------------------------------------------------------------

/// Handle to a running node; cheap to clone
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: SharedNodeConfig,
    routes: RouteTable,
    connections: DashMap<NodeId, Arc<Connection>>,
    dispatch: DispatchTable,
    forwarding: ForwardingTable,
    signing: SigningBoundary,
    workers: Arc<Semaphore>,
    ids: RequestIdGenerator,
    shutdown: CancellationToken,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.inner.config.node_id)
            .field("connections", &self.inner.connections.len())
            .field("routes", &self.inner.routes.len())
            .finish()
    }
}

impl Node {
    pub fn builder(node_id: NodeId) -> NodeBuilder {
        NodeBuilder::new(node_id)
    }

    pub(crate) fn from_parts(
        config: SharedNodeConfig,
        routes: RouteTable,
        dispatch: DispatchTable,
        forwarding: ForwardingTable,
        signing: SigningBoundary,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.dispatch.max_concurrent_handlers));
        let ids = RequestIdGenerator::new(config.node_id.as_str());
        Self {
            inner: Arc::new(NodeInner {
                config,
                routes,
                connections: DashMap::new(),
                dispatch,
                forwarding,
                signing,
                workers,
                ids,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &SharedNodeConfig {
        &self.inner.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub fn signing(&self) -> &SigningBoundary {
        &self.inner.signing
    }

    pub fn connection(&self, remote: &NodeId) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .get(remote)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Peers with a live connection, sorted
    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Fresh request id scoped to this node
    pub fn next_request_id(&self) -> RequestId {
        self.inner.ids.next_id()
    }

    /// Bring up a connection to `remote` and start its reader loop
    ///
    /// A previous connection to the same peer is closed.
    pub fn attach(
        &self,
        remote: NodeId,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Frame>,
    ) -> Arc<Connection> {
        let connection = Connection::new(remote.clone(), transport, Arc::clone(&self.inner.config));
        if let Some(previous) = self
            .inner
            .connections
            .insert(remote.clone(), Arc::clone(&connection))
        {
            debug!(node = %self.node_id(), %remote, "Replacing existing connection");
            tokio::spawn(async move { previous.close().await });
        }
        info!(node = %self.node_id(), %remote, "Connection attached");

        let inner = Arc::clone(&self.inner);
        let reader = Arc::clone(&connection);
        tokio::spawn(async move { inner.read_loop(reader, inbound).await });
        connection
    }

    /// Close the connection to `remote` and withdraw routes through it
    pub async fn detach(&self, remote: &NodeId) -> bool {
        let Some((_, connection)) = self.inner.connections.remove(remote) else {
            return false;
        };
        let withdrawn = self.inner.routes.remove_routes_via(remote);
        connection.close().await;
        info!(node = %self.node_id(), %remote, routes_withdrawn = withdrawn.len(), "Connection detached");
        true
    }

    /// Sign and send a request towards its destination, waiting for the reply
    pub async fn send_to(&self, mut request: Envelope, options: CallOptions) -> CallResponse {
        let destination = request.destination().clone();
        let Some(connection) = self.inner.next_hop_connection(&destination) else {
            return CallResponse::failed(Outcome::transport_failure(
                TransportError::NoRoute {
                    destination: destination.to_string(),
                }
                .to_string(),
            ));
        };

        if request.network_path().is_empty() {
            request.header_mut().network_path = NetworkPath::from_origin(self.node_id().clone());
        }
        let signed = self.inner.signing.sign(&mut request);
        if !signed.is_ok() {
            return CallResponse::failed(signed.to_outcome());
        }
        connection.send_request(request, options).await
    }

    /// Call `action` on `destination` with a JSON payload
    pub async fn call_json(
        &self,
        destination: NodeId,
        action: Action,
        payload: Value,
        options: CallOptions,
    ) -> CallResponse {
        let request = JsonRequest::new(self.next_request_id(), destination, action, payload);
        self.send_to(request.into(), options).await
    }

    /// Call `action` on `destination` with a binary payload
    pub async fn call_binary(
        &self,
        destination: NodeId,
        action: Action,
        payload: Vec<u8>,
        options: CallOptions,
    ) -> CallResponse {
        let request = BinaryRequest::new(self.next_request_id(), destination, action, payload);
        self.send_to(request.into(), options).await
    }

    /// Stop reader loops and close every connection
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.workers.close();
        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.connections.clear();
        for connection in connections {
            connection.close().await;
        }
        info!(node = %self.node_id(), "Node shut down");
    }
}

// ----------------------------------------------------------------------------
// Inbound Processing
// ----------------------------------------------------------------------------

impl NodeInner {
    fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// Connection towards `destination`: route entry first, then a direct link
    fn next_hop_connection(&self, destination: &NodeId) -> Option<Arc<Connection>> {
        let next_hop = self
            .routes
            .lookup(destination)
            .unwrap_or_else(|| destination.clone());
        self.connections
            .get(&next_hop)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn read_loop(self: Arc<Self>, connection: Arc<Connection>, mut inbound: mpsc::Receiver<Frame>) {
        debug!(node = %self.node_id(), remote = %connection.remote(), "Reader loop started");
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = connection.closed() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            connection.record_inbound(frame.len());
            self.on_frame(&connection, frame).await;
        }

        connection.connection_lost();
        self.connections
            .remove_if(connection.remote(), |_, current| Arc::ptr_eq(current, &connection));
        debug!(node = %self.node_id(), remote = %connection.remote(), "Reader loop stopped");
    }

    /// Handle one inbound frame
    ///
    /// Never waits on the worker pool: requests queue for a permit in their own task
    /// so that replies behind them are still read.
    async fn on_frame(self: &Arc<Self>, connection: &Arc<Connection>, frame: Frame) {
        let received_at = Instant::now();
        let envelope = match EnvelopeCodec::decode_with_limit(&frame, self.config.max_frame_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reject_malformed(connection, &frame, e).await;
                return;
            }
        };

        let verified = self.signing.verify(&envelope);
        if !verified.is_ok() {
            let outcome = verified.to_outcome();
            warn!(
                node = %self.node_id(),
                remote = %connection.remote(),
                request_id = %envelope.request_id(),
                reason = %outcome,
                "Signature verification failed"
            );
            if envelope.is_request() {
                let reply = envelope.error_reply(
                    reply_to(connection, &envelope),
                    self.node_id().clone(),
                    ErrorInfo::new(
                        ErrorCode::SecurityError,
                        outcome.description.clone().unwrap_or_default(),
                    ),
                );
                self.reply(connection, reply).await;
            } else {
                connection.pending().fail(envelope.request_id(), outcome);
            }
            return;
        }

        if envelope.is_reply() {
            connection.pending().resolve(envelope);
            return;
        }

        let inner = Arc::clone(self);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&inner.workers).acquire_owned().await else {
                debug!(node = %inner.node_id(), request_id = %envelope.request_id(), "Worker pool closed, dropping request");
                return;
            };
            inner.handle_request(connection, envelope, received_at).await;
        });
    }

    /// Answer a frame that did not decode
    async fn reject_malformed(&self, connection: &Connection, frame: &Frame, err: FormationError) {
        let Some(request_id) = EnvelopeCodec::peek_request_id(frame) else {
            warn!(node = %self.node_id(), remote = %connection.remote(), error = %err, "Dropping malformed frame");
            return;
        };

        // A broken reply still settles the request it answers.
        if connection
            .pending()
            .fail(&request_id, Outcome::formation_violation(err.to_string()))
        {
            return;
        }

        warn!(node = %self.node_id(), remote = %connection.remote(), %request_id, error = %err, "Malformed request");
        let header = Header {
            network_path: NetworkPath::from_origin(self.node_id().clone()),
            ..Header::new(request_id, connection.remote().clone())
        };
        let reply = JsonRequestError {
            header,
            error: ErrorInfo::new(ErrorCode::FormationViolation, err.to_string()),
        };
        self.reply(connection, reply.into()).await;
    }

    async fn handle_request(self: Arc<Self>, connection: Arc<Connection>, request: Envelope, received_at: Instant) {
        let decision = self.routes.decide(self.node_id(), &request, |node| {
            self.connections.contains_key(node)
        });
        trace!(node = %self.node_id(), request_id = %request.request_id(), ?decision, "Routing decision");

        match decision {
            RouteDecision::Loop => {
                let err = FormationError::RoutingLoop {
                    node: self.node_id().to_string(),
                };
                warn!(node = %self.node_id(), request_id = %request.request_id(), path = %request.network_path(), "Routing loop");
                let reply = request.error_reply(
                    reply_to(&connection, &request),
                    self.node_id().clone(),
                    ErrorInfo::new(ErrorCode::FormationViolation, err.to_string()),
                );
                self.reply(&connection, reply).await;
            }
            RouteDecision::Local => {
                let reply = self
                    .dispatch
                    .dispatch(self.node_id(), reply_to(&connection, &request), &request)
                    .await;
                self.reply(&connection, reply).await;
            }
            RouteDecision::Relay { next_hop } => {
                self.relay(connection, request, next_hop, received_at).await;
            }
        }
    }

    /// Sign and write a reply on the connection the request came in on
    async fn reply(&self, connection: &Connection, mut reply: Envelope) {
        let signed = self.signing.sign(&mut reply);
        if !signed.is_ok() {
            warn!(
                node = %self.node_id(),
                request_id = %reply.request_id(),
                reason = %signed.to_outcome(),
                "Sending reply without complete signatures"
            );
        }
        if let Err(e) = connection.send(&reply).await {
            warn!(node = %self.node_id(), remote = %connection.remote(), request_id = %reply.request_id(), error = %e, "Failed to send reply");
        }
    }

    // ------------------------------------------------------------------------
    // Relaying
    // ------------------------------------------------------------------------

    async fn relay(
        &self,
        upstream: Arc<Connection>,
        request: Envelope,
        next_hop: NodeId,
        received_at: Instant,
    ) {
        let local = self.node_id().clone();
        let reply_to = reply_to(&upstream, &request);
        let header = request.header().clone();
        let fail = |error: ErrorInfo| {
            Envelope::JsonRequestError(JsonRequestError {
                header: header.reply(reply_to.clone(), local.clone()),
                error,
            })
        };

        let Some(downstream) = self
            .connections
            .get(&next_hop)
            .map(|entry| Arc::clone(entry.value()))
        else {
            let err = TransportError::NoRoute {
                destination: request.destination().to_string(),
            };
            self.reply(&upstream, fail(ErrorInfo::new(ErrorCode::TransportFailure, err.to_string())))
                .await;
            return;
        };
        let (Some(action), Some(payload)) = (request.action().cloned(), Payload::of(&request)) else {
            return;
        };

        let budget = request
            .timeout()
            .unwrap_or(self.config.request.default_timeout);
        let ctx = RelayContext {
            request_id: header.request_id.clone(),
            action: action.clone(),
            relay: local.clone(),
            previous_hop: upstream.remote().clone(),
            next_hop: next_hop.clone(),
            destination: header.destination.clone(),
            network_path: header.network_path.clone(),
        };
        let decision = self
            .forwarding
            .pipeline_for(action.as_str())
            .evaluate(ctx, payload)
            .await;

        let mut outbound = request;
        match decision.result {
            ForwardingResult::Reject => {
                let reply = match decision.reject {
                    Some(RejectReply::Response { payload, result }) => {
                        filtered_response(header.reply(reply_to.clone(), local.clone()), payload, result)
                    }
                    Some(RejectReply::Error(info)) => fail(info),
                    None => fail(ErrorInfo::new(ErrorCode::Filtered, "request filtered")),
                };
                self.reply(&upstream, reply).await;
                return;
            }
            ForwardingResult::Replace => {
                if let Some(payload) = decision.outbound {
                    if let Err(info) = replace_payload(&mut outbound, payload) {
                        notify(decision.on_sent, Outcome::exception(info.description.clone())).await;
                        self.reply(&upstream, fail(info)).await;
                        return;
                    }
                }
            }
            ForwardingResult::Forward => {}
        }

        let remaining = remaining_budget(budget, received_at);
        if remaining.is_zero() {
            let outcome = Outcome::timeout(budget);
            debug!(node = %local, request_id = %header.request_id, "Relay budget exhausted");
            notify(decision.on_sent, outcome.clone()).await;
            self.reply(&upstream, fail(ErrorInfo::from_outcome(&outcome))).await;
            return;
        }

        // Ids only name a call on one connection; the downstream leg gets its own.
        let downstream_id = downstream.next_request_id();
        outbound.header_mut().request_id = downstream_id.clone();
        outbound.push_hop(local.clone());
        let signed = self.signing.sign(&mut outbound);
        if !signed.is_ok() {
            let outcome = signed.to_outcome();
            notify(decision.on_sent, outcome.clone()).await;
            self.reply(&upstream, fail(ErrorInfo::from_outcome(&outcome))).await;
            return;
        }

        debug!(
            node = %local,
            request_id = %header.request_id,
            %downstream_id,
            %action,
            %next_hop,
            remaining_ms = remaining.as_millis() as u64,
            "Relaying request"
        );
        let response = match downstream
            .start_request(outbound, CallOptions::new().with_timeout(remaining))
            .await
        {
            Ok(in_flight) => {
                notify(decision.on_sent, Outcome::ok()).await;
                in_flight.wait().await
            }
            Err(failed) => {
                notify(decision.on_sent, failed.outcome.clone()).await;
                failed
            }
        };

        let reply = match response.response {
            Some(mut reply) => {
                reply.header_mut().request_id = header.request_id.clone();
                reply.push_hop(local.clone());
                reply
            }
            None => fail(ErrorInfo::from_outcome(&response.outcome)),
        };
        self.reply(&upstream, reply).await;
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Replies go to the originator, or to the neighbour for direct delivery
fn reply_to(connection: &Connection, request: &Envelope) -> NodeId {
    request
        .network_path()
        .origin()
        .cloned()
        .unwrap_or_else(|| connection.remote().clone())
}

/// Budget left for the downstream hop: received_at + budget - now
fn remaining_budget(budget: Duration, received_at: Instant) -> Duration {
    budget.saturating_sub(received_at.elapsed())
}

async fn notify(on_sent: Option<SentNotifier>, outcome: Outcome) {
    if let Some(on_sent) = on_sent {
        on_sent.notify(outcome).await;
    }
}

fn filtered_response(header: Header, payload: Payload, result: ResultCode) -> Envelope {
    match payload {
        Payload::Json(payload) => JsonResponse {
            header,
            payload,
            result,
        }
        .into(),
        Payload::Binary(payload) => BinaryResponse {
            header,
            payload,
            result,
        }
        .into(),
    }
}

/// Swap in a rewritten payload; the original signatures no longer apply
fn replace_payload(request: &mut Envelope, payload: Payload) -> Result<(), ErrorInfo> {
    match (&mut *request, payload) {
        (Envelope::JsonRequest(m), Payload::Json(payload)) => m.payload = payload,
        (Envelope::BinaryRequest(m), Payload::Binary(payload)) => m.payload = payload,
        _ => {
            return Err(ErrorInfo::new(
                ErrorCode::InternalError,
                "rewritten payload does not match the request kind",
            ))
        }
    }
    request.header_mut().signatures.clear();
    Ok(())
}
