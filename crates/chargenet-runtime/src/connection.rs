//! Connection to one remote peer
//!
//! A [`Connection`] owns the outbound side of a link: the send lock serializing
//! writes, the pending table correlating the requests it wrote, and counters for
//! diagnostics. The inbound reader loop lives in the node, which decides what to do
//! with each frame.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chargenet_core::{
    ChargenetError, Envelope, EnvelopeCodec, NodeId, Outcome, RequestId, RequestIdGenerator,
    Result, SharedNodeConfig, TransportError,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::correlation::{
    CallOptions, CallResponse, CorrelationStats, PendingHandle, PendingRequests,
};
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FrameCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_failures: AtomicU64,
}

/// Snapshot of a connection's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub correlation: CorrelationStats,
}

// ----------------------------------------------------------------------------
// In-flight Call
// ----------------------------------------------------------------------------

/// A request that has been written and awaits its resolution
#[derive(Debug)]
pub struct InFlight {
    connection: Arc<Connection>,
    handle: PendingHandle,
    cancel: Option<CancellationToken>,
}

impl InFlight {
    pub async fn wait(self) -> CallResponse {
        self.connection
            .pending
            .wait(self.handle, self.cancel)
            .await
    }
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// Outbound side of a persistent link to `remote`
pub struct Connection {
    remote: NodeId,
    transport: Arc<dyn Transport>,
    send_lock: Mutex<()>,
    pending: PendingRequests,
    ids: RequestIdGenerator,
    config: SharedNodeConfig,
    counters: FrameCounters,
    closed: CancellationToken,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Connection {
    pub fn new(remote: NodeId, transport: Arc<dyn Transport>, config: SharedNodeConfig) -> Arc<Self> {
        let ids = RequestIdGenerator::new(format!("{}-{}", config.node_id, remote));
        Arc::new(Self {
            pending: PendingRequests::new(config.late_response),
            remote,
            transport,
            send_lock: Mutex::new(()),
            ids,
            config,
            counters: FrameCounters::default(),
            closed: CancellationToken::new(),
        })
    }

    pub fn remote(&self) -> &NodeId {
        &self.remote
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Fresh request id for a call on this connection, e.g. a relayed request
    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed or lost
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            correlation: self.pending.stats(),
        }
    }

    pub(crate) fn record_inbound(&self, bytes: usize) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Write one envelope under the send lock
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed {
                remote: self.remote.to_string(),
            }
            .into());
        }
        let frame = EnvelopeCodec::encode(envelope)?;
        let size = frame.len();

        let lock_timeout = self.config.request.send_lock_timeout;
        let _guard = timeout(lock_timeout, self.send_lock.lock())
            .await
            .map_err(|_| {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(remote = %self.remote, request_id = %envelope.request_id(), "Send lock timeout");
                TransportError::SendLockTimeout {
                    duration_ms: lock_timeout.as_millis() as u64,
                }
            })?;

        if let Err(e) = self.transport.send_frame(frame).await {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(size as u64, Ordering::Relaxed);
        trace!(remote = %self.remote, request_id = %envelope.request_id(), kind = ?envelope.kind(), size, "Frame written");
        Ok(())
    }

    /// Register and write a request, returning the in-flight call
    ///
    /// Fails without writing when the request id is already in flight, the budget is
    /// exhausted, or the write itself fails.
    pub async fn start_request(
        self: &Arc<Self>,
        mut request: Envelope,
        options: CallOptions,
    ) -> core::result::Result<InFlight, CallResponse> {
        if !request.is_request() {
            return Err(CallResponse::failed(Outcome::generic_error(
                "only requests can be correlated",
            )));
        }

        let budget = options
            .timeout
            .unwrap_or(self.config.request.default_timeout);
        if budget.is_zero() {
            return Err(CallResponse::failed(Outcome::timeout(budget)));
        }
        request.set_timeout(budget);

        let request_id = request.request_id().clone();
        let handle = match self
            .pending
            .register(request_id.clone(), request.action().cloned(), budget)
        {
            Ok(handle) => handle,
            Err(e) => {
                debug!(remote = %self.remote, %request_id, "Refusing duplicate request id");
                return Err(CallResponse::failed(Outcome::generic_error(e.to_string())));
            }
        };

        if let Err(e) = self.send(&request).await {
            drop(handle);
            return Err(CallResponse::failed(send_failure_outcome(e)));
        }

        Ok(InFlight {
            connection: Arc::clone(self),
            handle,
            cancel: options.cancel,
        })
    }

    /// Write a request and wait for its resolution
    pub async fn send_request(self: &Arc<Self>, request: Envelope, options: CallOptions) -> CallResponse {
        match self.start_request(request, options).await {
            Ok(in_flight) => in_flight.wait().await,
            Err(response) => response,
        }
    }

    /// Close the link; every pending request resolves with `TransportFailure`
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self.transport.close().await {
            debug!(remote = %self.remote, error = %e, "Transport close failed");
        }
        self.fail_pending();
    }

    /// The inbound side went away
    pub(crate) fn connection_lost(&self) {
        if !self.closed.is_cancelled() {
            info!(remote = %self.remote, "Connection lost");
            self.closed.cancel();
        }
        self.fail_pending();
    }

    fn fail_pending(&self) {
        self.pending.fail_all(Outcome::transport_failure(format!(
            "connection to {} closed",
            self.remote
        )));
    }
}

fn send_failure_outcome(err: ChargenetError) -> Outcome {
    match err {
        ChargenetError::Formation(e) => Outcome::formation_violation(e.to_string()),
        ChargenetError::Transport(e) => Outcome::transport_failure(e.to_string()),
        other => Outcome::generic_error(other.to_string()),
    }
}
