//! Request/response correlation
//!
//! Every request written to a connection gets a slot in [`PendingRequests`], keyed by
//! its request id. Exactly one of reply, timeout, cancellation or connection loss
//! fills the slot: whoever removes it from the table owns the resolution, everyone
//! else observes that the slot is gone. A [`PendingHandle`] dropped before its
//! request resolved takes its slot with it.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

use chargenet_core::{
    Action, ChargenetError, Envelope, LateResponsePolicy, Outcome, RequestId, Result,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// ----------------------------------------------------------------------------
// Call Options and Responses
// ----------------------------------------------------------------------------

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Budget for this call; the node default applies when unset
    pub timeout: Option<Duration>,
    /// Withdraws the caller when cancelled
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// What a caller gets back from a request
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub outcome: Outcome,
    /// Reply envelope (response or error) when one arrived
    pub response: Option<Envelope>,
    /// Time between writing the request and its resolution
    pub runtime: Duration,
}

impl CallResponse {
    /// Resolution without a reply envelope
    pub fn failed(outcome: Outcome) -> Self {
        Self {
            outcome,
            response: None,
            runtime: Duration::ZERO,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// JSON body of a successful response
    pub fn json_payload(&self) -> Option<&serde_json::Value> {
        match &self.response {
            Some(Envelope::JsonResponse(m)) => Some(&m.payload),
            _ => None,
        }
    }

    /// Binary body of a successful response
    pub fn binary_payload(&self) -> Option<&[u8]> {
        match &self.response {
            Some(Envelope::BinaryResponse(m)) => Some(&m.payload),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Pending Table
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum Resolution {
    Reply(Envelope),
    Failed(Outcome),
}

#[derive(Debug)]
struct PendingSlot {
    /// Distinguishes this registration from later ones reusing the id
    seq: u64,
    action: Option<Action>,
    sent_at: Instant,
    deadline: Instant,
    resolve: oneshot::Sender<Resolution>,
}

type Slots = Arc<DashMap<RequestId, PendingSlot>>;

/// Waiter side of a registered request
///
/// Dropping the handle before the request resolved removes its slot.
#[derive(Debug)]
pub struct PendingHandle {
    request_id: RequestId,
    seq: u64,
    slots: Slots,
    receiver: oneshot::Receiver<Resolution>,
    registered_at: Instant,
    deadline: Instant,
    timeout: Duration,
}

impl PendingHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Remove the slot if it is still ours
    fn take_slot(&self) -> bool {
        let seq = self.seq;
        self.slots
            .remove_if(&self.request_id, |_, slot| slot.seq == seq)
            .is_some()
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if self.take_slot() {
            debug!(request_id = %self.request_id, "Pending request abandoned by caller");
        }
    }
}

/// Counters kept by the pending table
#[derive(Debug, Default)]
struct CorrelationCounters {
    registered: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    unmatched: AtomicU64,
}

/// Snapshot of the pending table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub registered: u64,
    /// Filled by a reply
    pub resolved: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Failed by connection loss or a local error
    pub failed: u64,
    /// Replies without a pending request
    pub unmatched: u64,
}

/// In-flight requests of one connection direction
#[derive(Debug)]
pub struct PendingRequests {
    slots: Slots,
    next_seq: AtomicU64,
    late_response: LateResponsePolicy,
    counters: CorrelationCounters,
}

enum Wake {
    Resolved(core::result::Result<Resolution, oneshot::error::RecvError>),
    Deadline,
    Cancelled,
}

impl PendingRequests {
    pub fn new(late_response: LateResponsePolicy) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(0),
            late_response,
            counters: CorrelationCounters::default(),
        }
    }

    /// Register a request about to be written
    ///
    /// Fails with [`ChargenetError::DuplicateRequestId`] while a request with the same id
    /// is still in flight.
    pub fn register(
        &self,
        request_id: RequestId,
        action: Option<Action>,
        timeout: Duration,
    ) -> Result<PendingHandle> {
        let now = Instant::now();
        let deadline = now + timeout;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (resolve, receiver) = oneshot::channel();

        match self.slots.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ChargenetError::DuplicateRequestId {
                    request_id: request_id.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingSlot {
                    seq,
                    action,
                    sent_at: now,
                    deadline,
                    resolve,
                });
            }
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);

        Ok(PendingHandle {
            request_id,
            seq,
            slots: Arc::clone(&self.slots),
            receiver,
            registered_at: now,
            deadline,
            timeout,
        })
    }

    /// Fill the slot matching an inbound reply
    ///
    /// Returns `false` when no request with that id is pending; the reply is then
    /// dropped according to the late-response policy.
    pub fn resolve(&self, reply: Envelope) -> bool {
        let request_id = reply.request_id().clone();
        match self.slots.remove(&request_id) {
            Some((_, slot)) => {
                trace!(
                    %request_id,
                    action = ?slot.action.as_ref().map(Action::as_str),
                    elapsed_ms = slot.sent_at.elapsed().as_millis() as u64,
                    "Pending request resolved"
                );
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                let _ = slot.resolve.send(Resolution::Reply(reply));
                true
            }
            None => {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                match self.late_response {
                    LateResponsePolicy::Log => {
                        warn!(%request_id, kind = ?reply.kind(), "Dropping reply without pending request")
                    }
                    LateResponsePolicy::Discard => {
                        trace!(%request_id, "Discarding reply without pending request")
                    }
                }
                false
            }
        }
    }

    /// Fail one pending request locally
    pub fn fail(&self, request_id: &RequestId, outcome: Outcome) -> bool {
        match self.slots.remove(request_id) {
            Some((_, slot)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let _ = slot.resolve.send(Resolution::Failed(outcome));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request, e.g. on connection loss
    pub fn fail_all(&self, outcome: Outcome) -> usize {
        let ids: Vec<RequestId> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let failed = ids
            .iter()
            .filter(|id| self.fail(id, outcome.clone()))
            .count();
        if failed > 0 {
            debug!(failed, reason = %outcome, "Failed pending requests");
        }
        failed
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.slots.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|entry| entry.value().deadline).min()
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }

    /// Suspend until the request resolves, times out or is cancelled
    pub async fn wait(
        &self,
        mut handle: PendingHandle,
        cancel: Option<CancellationToken>,
    ) -> CallResponse {
        let deadline = handle.deadline;
        let timeout = handle.timeout;

        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => futures::future::pending::<()>().await,
            }
        };

        let wake = tokio::select! {
            resolution = &mut handle.receiver => Wake::Resolved(resolution),
            _ = sleep_until(deadline) => Wake::Deadline,
            _ = cancelled => Wake::Cancelled,
        };

        let resolution = match wake {
            Wake::Resolved(resolution) => resolution.unwrap_or_else(|_| {
                Resolution::Failed(Outcome::transport_failure("pending slot dropped"))
            }),
            Wake::Deadline => {
                self.withdraw(&mut handle, Outcome::timeout(timeout), &self.counters.timed_out)
                    .await
            }
            Wake::Cancelled => {
                self.withdraw(&mut handle, Outcome::cancelled(), &self.counters.cancelled)
                    .await
            }
        };

        let runtime = handle.registered_at.elapsed();
        match resolution {
            Resolution::Reply(reply) => CallResponse {
                outcome: reply.reply_outcome().with_runtime(runtime),
                response: Some(reply),
                runtime,
            },
            Resolution::Failed(outcome) => CallResponse {
                outcome: outcome.with_runtime(runtime),
                response: None,
                runtime,
            },
        }
    }

    /// Remove our own slot; if someone else already did, take their resolution
    async fn withdraw(
        &self,
        handle: &mut PendingHandle,
        outcome: Outcome,
        counter: &AtomicU64,
    ) -> Resolution {
        if handle.take_slot() {
            counter.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %handle.request_id, reason = %outcome, "Pending request withdrawn");
            return Resolution::Failed(outcome);
        }
        (&mut handle.receiver).await.unwrap_or_else(|_| {
            Resolution::Failed(Outcome::transport_failure("pending slot dropped"))
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
