//! RPC Correlation
//!
//! Single responsibility: match every outstanding request to exactly one
//! [`Outcome`].
//!
//! # Lifecycle
//!
//! ```text
//!   register ──► pending ──┬── reply / error ──► resolved
//!                  │       ├── deadline passed ─► Timeout
//!                  │       └── cancel ──────────► Cancelled
//!                  └── take (redirect, resend) ──► re-registered under a new id
//! ```
//!
//! The result slot travels with the request when it is re-keyed, so the
//! caller's [`ReplyHandle`] stays valid across redirects and resends. Whoever
//! takes the sender out of the slot first delivers the outcome; every later
//! attempt is a logged no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::types::{DcId, RequestId};

/// Terminal result of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Bytes),
    Error(RpcError),
    Timeout,
}

impl Outcome {
    pub fn into_result(self) -> Result<Bytes, RpcError> {
        match self {
            Outcome::Success(bytes) => Ok(bytes),
            Outcome::Error(e) => Err(e),
            Outcome::Timeout => Err(RpcError::Timeout),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

type ResultSlot = Arc<Mutex<Option<oneshot::Sender<Outcome>>>>;

fn take_sender(slot: &ResultSlot) -> Option<oneshot::Sender<Outcome>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn slot_is_open(slot: &ResultSlot) -> bool {
    let check = |s: &Option<oneshot::Sender<Outcome>>| s.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false);
    match slot.lock() {
        Ok(guard) => check(&guard),
        Err(poisoned) => check(&poisoned.into_inner()),
    }
}

/// One outstanding call.
#[derive(Debug)]
pub struct PendingRequest {
    call_id: RequestId,
    request_id: RequestId,
    dc: DcId,
    payload: Bytes,
    registered_at: Instant,
    deadline: Instant,
    redirects: u8,
    resends: u8,
    salt_retries: u8,
    slot: ResultSlot,
}

impl PendingRequest {
    /// Id handed to the caller; stable across re-sends.
    pub fn call_id(&self) -> RequestId {
        self.call_id
    }

    /// Message id of the envelope currently carrying the request.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn redirects(&self) -> u8 {
        self.redirects
    }

    pub fn resends(&self) -> u8 {
        self.resends
    }

    pub fn record_redirect(&mut self) {
        self.redirects = self.redirects.saturating_add(1);
    }

    pub fn record_resend(&mut self) {
        self.resends = self.resends.saturating_add(1);
    }

    /// Times the request was re-sent after the server rotated its salt.
    pub fn salt_retries(&self) -> u8 {
        self.salt_retries
    }

    pub fn record_salt_retry(&mut self) {
        self.salt_retries = self.salt_retries.saturating_add(1);
    }

    /// False once an outcome was delivered or the caller stopped waiting.
    pub fn is_awaited(&self) -> bool {
        slot_is_open(&self.slot)
    }

    /// Deliver `outcome`. Returns false if one was already delivered.
    pub fn complete(self, outcome: Outcome) -> bool {
        match take_sender(&self.slot) {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(call_id = self.call_id, "Caller stopped waiting before resolution");
                }
                true
            }
            None => {
                warn!(
                    call_id = self.call_id,
                    request_id = self.request_id,
                    "Second resolution attempt ignored"
                );
                false
            }
        }
    }
}

/// Caller side of a pending call. Resolves to exactly one [`Outcome`].
#[derive(Debug)]
pub struct ReplyHandle {
    call_id: RequestId,
    rx: oneshot::Receiver<Outcome>,
    slot: ResultSlot,
}

impl ReplyHandle {
    pub fn call_id(&self) -> RequestId {
        self.call_id
    }

    /// Resolve with `Cancelled` unless an outcome was already delivered.
    pub fn cancel(&self) -> bool {
        match take_sender(&self.slot) {
            Some(tx) => {
                let _ = tx.send(Outcome::Error(RpcError::Cancelled));
                true
            }
            None => false,
        }
    }
}

impl Future for ReplyHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Every sender path resolves before dropping, so this only happens
            // if the whole client was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Outcome::Error(RpcError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Where a call currently lives.
#[derive(Debug)]
struct CallEntry {
    request_id: RequestId,
    slot: ResultSlot,
}

/// Table of outstanding calls, keyed by the message id that carried them.
#[derive(Debug, Default)]
pub struct RpcCorrelator {
    pending: DashMap<RequestId, PendingRequest>,
    /// call id → current request id and result slot. Survives `take`, so a
    /// call can be cancelled while it is between connections.
    calls: DashMap<RequestId, CallEntry>,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call sent as `request_id`.
    pub fn register(&self, request_id: RequestId, dc: DcId, payload: Bytes, deadline: Instant) -> ReplyHandle {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let request = PendingRequest {
            call_id: request_id,
            request_id,
            dc,
            payload,
            registered_at: Instant::now(),
            deadline,
            redirects: 0,
            resends: 0,
            salt_retries: 0,
            slot: Arc::clone(&slot),
        };
        self.calls.insert(
            request_id,
            CallEntry {
                request_id,
                slot: Arc::clone(&slot),
            },
        );
        self.pending.insert(request_id, request);
        debug!(request_id = request_id, dc = %dc, "Request registered");
        ReplyHandle {
            call_id: request_id,
            rx,
            slot,
        }
    }

    /// Track a previously taken call again, now sent as `request_id` to `dc`.
    ///
    /// A call that was resolved or cancelled in the meantime is dropped.
    pub fn reregister(&self, mut request: PendingRequest, request_id: RequestId, dc: DcId) {
        if !request.is_awaited() {
            debug!(call_id = request.call_id, request_id = request_id, "Call already finished, not re-keyed");
            self.calls.remove(&request.call_id);
            return;
        }
        debug!(
            call_id = request.call_id,
            from = request.request_id,
            to = request_id,
            dc = %dc,
            "Request re-keyed"
        );
        request.request_id = request_id;
        request.dc = dc;
        if let Some(mut entry) = self.calls.get_mut(&request.call_id) {
            entry.request_id = request_id;
        }
        self.pending.insert(request_id, request);
    }

    /// Remove a call without resolving it. It can still be cancelled by
    /// call id until it is re-registered or completed.
    pub fn take(&self, request_id: RequestId) -> Option<PendingRequest> {
        self.pending.remove(&request_id).map(|(_, request)| request)
    }

    /// Take and complete, forgetting the call id.
    fn finish(&self, request_id: RequestId, outcome: Outcome) -> Option<bool> {
        let request = self.take(request_id)?;
        self.calls.remove(&request.call_id);
        Some(request.complete(outcome))
    }

    /// Deliver `outcome` to the call sent as `request_id`.
    ///
    /// Unknown ids (late or duplicate replies) are logged and ignored.
    pub fn resolve(&self, request_id: RequestId, outcome: Outcome) -> bool {
        match self.finish(request_id, outcome) {
            Some(delivered) => delivered,
            None => {
                warn!(request_id = request_id, "Reply for unknown or already resolved request");
                false
            }
        }
    }

    /// Cancel by call id. Works while the call is registered and while it is
    /// taken out for a redirect or resend.
    pub fn cancel(&self, call_id: RequestId) -> bool {
        let (_, entry) = match self.calls.remove(&call_id) {
            Some(found) => found,
            None => return false,
        };
        self.pending
            .remove_if(&entry.request_id, |_, request| request.call_id == call_id);
        match take_sender(&entry.slot) {
            Some(tx) => {
                let _ = tx.send(Outcome::Error(RpcError::Cancelled));
                debug!(call_id = call_id, "Request cancelled");
                true
            }
            None => false,
        }
    }

    /// Resolve every call whose deadline is at or before `now` with `Timeout`.
    ///
    /// Also forgets calls whose outcome was delivered elsewhere or whose
    /// caller stopped waiting.
    pub fn on_timeout_sweep(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut resolved = 0;
        for request_id in expired {
            if let Some(true) = self.finish(request_id, Outcome::Timeout) {
                debug!(request_id = request_id, "Request timed out");
                resolved += 1;
            }
        }
        self.calls.retain(|_, entry| slot_is_open(&entry.slot));
        self.pending.retain(|_, request| request.is_awaited());
        resolved
    }

    /// Current request ids of every call sent to `dc`, oldest first.
    pub fn ids_for_dc(&self, dc: DcId) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.dc == dc)
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every call currently sent to `dc`.
    pub fn take_for_dc(&self, dc: DcId) -> Vec<PendingRequest> {
        self.ids_for_dc(dc)
            .into_iter()
            .filter_map(|id| self.take(id))
            .collect()
    }

    /// Resolve every remaining call with `outcome`.
    pub fn fail_all(&self, outcome: Outcome) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let failed = ids
            .into_iter()
            .filter_map(|id| self.finish(id, outcome.clone()))
            .filter(|delivered| *delivered)
            .count();
        self.calls.clear();
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Earliest deadline among outstanding calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|entry| entry.deadline).min()
    }
}
