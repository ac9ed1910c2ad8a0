//! Admission-controlled, priority-ordered, per-conversation-serialized queue.
//!
//! The item dispatched next is the highest-priority item among all items
//! whose conversation has no in-flight request; within equal priority the
//! earliest submission wins. A conversation with an in-flight request
//! contributes no further candidates until that request reaches a terminal
//! state.
//!
//! All queue state (pending list + in-flight index) lives behind one mutex;
//! workers park on a `Notify` and re-check eligibility on every wakeup.

use std::collections::HashMap;

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use super::breaker::{BreakerError, CircuitBreaker};
use super::request::CompletionRequest;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("completion queue is full: capacity {capacity}")]
    Overflow { capacity: usize },

    #[error(transparent)]
    CircuitBreakerTripped(#[from] BreakerError),

    #[error("request not found: {request_id}")]
    NotFound { request_id: String },
}

impl QueueError {
    /// Stable reason string used in `completion:rejected` payloads.
    pub fn reason(&self) -> &'static str {
        match self {
            QueueError::Overflow { .. } => "queue_overflow",
            QueueError::CircuitBreakerTripped(_) => "circuit_breaker_tripped",
            QueueError::NotFound { .. } => "not_found",
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
}

struct PendingEntry {
    seq: u64,
    request: CompletionRequest,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingEntry>,
    /// conversation_id → in-flight request_id.
    in_flight: HashMap<String, String>,
    next_seq: u64,
}

impl QueueState {
    /// Index of the next dispatchable entry: min (priority, submitted_at,
    /// seq) over conversations with nothing in flight.
    fn eligible_index(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, e)| !self.in_flight.contains_key(&e.request.conversation_id))
            .min_by_key(|(_, e)| (e.request.priority, e.request.submitted_at, e.seq))
            .map(|(i, _)| i)
    }
}

pub struct CompletionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    breaker: Arc<CircuitBreaker>,
    /// Cooperative cancellation handles for dispatched requests.
    cancels: DashMap<String, watch::Sender<bool>>,
}

impl CompletionQueue {
    pub fn new(capacity: usize, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
            breaker,
            cancels: DashMap::new(),
        }
    }

    /// Admits a request. Rejects with `Overflow` above capacity and with
    /// `CircuitBreakerTripped` when an injected request's chain budget is
    /// already exhausted; top-level requests bypass the breaker entirely.
    pub fn submit(&self, request: CompletionRequest) -> QueueResult<String> {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.pending.len() >= self.capacity {
            return Err(QueueError::Overflow {
                capacity: self.capacity,
            });
        }
        if request.is_injected() {
            self.breaker.admit_injection(&request.chain_id)?;
        }

        let request_id = request.request_id.clone();
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(
            request_id,
            conversation_id = %request.conversation_id,
            priority = %request.priority,
            depth = request.depth,
            "request queued"
        );
        state.pending.push(PendingEntry { seq, request });
        drop(state);

        self.notify.notify_waiters();
        Ok(request_id)
    }

    /// Waits for the next conversation-eligible request and marks its
    /// conversation in flight. The returned watch receiver flips to `true`
    /// when the request is cancelled mid-execution.
    pub async fn next(&self) -> (CompletionRequest, watch::Receiver<bool>) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(dispatched) = self.try_dispatch() {
                return dispatched;
            }
            trace!("no eligible request, worker parked");
            notified.await;
        }
    }

    fn try_dispatch(&self) -> Option<(CompletionRequest, watch::Receiver<bool>)> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let index = state.eligible_index()?;
        let entry = state.pending.remove(index);
        state.in_flight.insert(
            entry.request.conversation_id.clone(),
            entry.request.request_id.clone(),
        );
        drop(state);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .insert(entry.request.request_id.clone(), cancel_tx);
        debug!(
            request_id = %entry.request.request_id,
            conversation_id = %entry.request.conversation_id,
            "request dispatched"
        );
        Some((entry.request, cancel_rx))
    }

    /// Marks a dispatched request terminal, freeing its conversation for the
    /// next candidate.
    pub fn complete(&self, request: &CompletionRequest) {
        let mut state = self.state.lock().expect("queue state poisoned");
        let freed = match state.in_flight.get(&request.conversation_id) {
            Some(active) if *active == request.request_id => {
                state.in_flight.remove(&request.conversation_id);
                true
            }
            _ => false,
        };
        drop(state);

        self.cancels.remove(&request.request_id);
        if freed {
            self.notify.notify_waiters();
        }
    }

    /// Cancels a request. Pending requests are removed outright (an injected
    /// request's breaker admission is returned); in-flight requests get a
    /// cooperative cancel signal. Returns `NotFound` for unknown ids.
    pub fn cancel(&self, request_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock().expect("queue state poisoned");
        if let Some(index) = state
            .pending
            .iter()
            .position(|e| e.request.request_id == request_id)
        {
            let entry = state.pending.remove(index);
            drop(state);
            if entry.request.is_injected() {
                self.breaker.release_admission(&entry.request.chain_id);
            }
            debug!(request_id, "pending request cancelled");
            return Ok(());
        }
        drop(state);

        if let Some(cancel) = self.cancels.get(request_id) {
            // Receiver may already be gone if the worker just finished.
            let _ = cancel.send(true);
            debug!(request_id, "cancel signalled to in-flight request");
            return Ok(());
        }
        Err(QueueError::NotFound {
            request_id: request_id.to_string(),
        })
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock().expect("queue state poisoned");
        QueueStatus {
            queued: state.pending.len(),
            active: state.in_flight.len(),
        }
    }
}
