//! Ordered, deduplicated execution requests and their completions.
//!
//! At most one request is in flight at a time. Resubmitting an id replaces
//! the earlier request: a queued one is dropped, an in-flight one is
//! *abandoned* and its eventual response swallowed. An error result discards
//! the rest of the queue without notifying anyone.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use cellrun_sandbox::{ErrorKind, ExecutionError, ExecutionResponse};
use tokio::sync::oneshot;

use crate::error::Error;

/// The outcome of one execution, delivered exactly once to its requester.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Id of the request.
    pub id: String,
    /// Sequence number assigned when the request was enqueued.
    pub sequence_number: u64,
    /// Result value, absent for `null` results and failures.
    pub value: Option<serde_json::Value>,
    /// Structured error, present when the execution failed.
    pub error: Option<ExecutionError>,
    /// Whether the cell ended with an assignment.
    pub assignment: Option<bool>,
}

impl ExecutionResult {
    fn from_response(response: ExecutionResponse, sequence_number: u64) -> Self {
        Self {
            id: response.id,
            sequence_number,
            value: response.value,
            error: response.error,
            assignment: response.assignment,
        }
    }

    fn transport_failure(id: String, sequence_number: u64, description: String) -> Self {
        Self {
            id,
            sequence_number,
            value: None,
            error: Some(ExecutionError::new(ErrorKind::Transport, description)),
            assignment: None,
        }
    }

    /// Whether the execution failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Callback form of result delivery.
pub type ExecutionCallback = Box<dyn FnOnce(ExecutionResult) + Send + 'static>;

/// Where a request's result goes. Dropping it without completing means the
/// request was discarded.
pub(crate) enum Responder {
    Channel(oneshot::Sender<ExecutionResult>),
    Callback(ExecutionCallback),
}

impl Responder {
    /// A channel responder and the handle that resolves from it.
    pub(crate) fn channel(id: &str) -> (Self, ExecutionHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = ExecutionHandle {
            id: id.to_string(),
            state: HandleState::Waiting(rx),
        };
        (Self::Channel(tx), handle)
    }

    fn complete(self, result: ExecutionResult) {
        match self {
            // The requester may have stopped waiting; that is fine.
            Self::Channel(tx) => {
                let _ = tx.send(result);
            }
            Self::Callback(callback) => callback(result),
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Responder::Channel"),
            Self::Callback(_) => f.write_str("Responder::Callback"),
        }
    }
}

/// Future resolving to the result of one execution request.
///
/// Resolves to [`Error::Discarded`] if the request is dropped without
/// running, and to [`Error::ServiceClosed`] if the service was already shut
/// down when the request was made.
#[must_use = "dropping the handle does not cancel the request"]
pub struct ExecutionHandle {
    id: String,
    state: HandleState,
}

enum HandleState {
    Waiting(oneshot::Receiver<ExecutionResult>),
    Closed,
}

impl ExecutionHandle {
    pub(crate) fn closed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: HandleState::Closed,
        }
    }

    /// Id of the request this handle waits on.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("closed", &matches!(self.state, HandleState::Closed))
            .finish()
    }
}

impl Future for ExecutionHandle {
    type Output = Result<ExecutionResult, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Closed => Poll::Ready(Err(Error::ServiceClosed)),
            HandleState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.map_err(|_| Error::Discarded(this.id.clone()))),
        }
    }
}

/// A queued request for one cell.
pub struct ExecutionRequest {
    /// Caller-chosen id; at most one request per id is live.
    pub id: String,
    /// Monotonic enqueue order.
    pub sequence_number: u64,
    /// Source text to evaluate.
    pub source: String,
    responder: Responder,
}

impl fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("id", &self.id)
            .field("sequence_number", &self.sequence_number)
            .field("source_len", &self.source.len())
            .finish_non_exhaustive()
    }
}

/// The request currently being evaluated by the backend.
#[derive(Debug)]
struct InFlight {
    id: String,
    // None once abandoned.
    request: Option<ExecutionRequest>,
}

/// What happened when a result arrived.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Delivered a successful result.
    Delivered,
    /// Delivered an error result and discarded this many queued requests.
    Failed { discarded: usize },
    /// The in-flight request had been abandoned; the result was dropped.
    Abandoned,
    /// The result did not match the in-flight request.
    Unexpected(String),
}

/// What a clear removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Cleared {
    /// Queued requests dropped.
    pub discarded: usize,
    /// Id of an in-flight request that is now abandoned.
    pub abandoned: Option<String>,
}

/// Pending requests plus the in-flight slot.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    pending: VecDeque<ExecutionRequest>,
    in_flight: Option<InFlight>,
    next_sequence: u64,
}

impl ExecutionQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests waiting to be dispatched.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a request is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Id of the in-flight request, abandoned or not.
    #[must_use]
    pub fn in_flight_id(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|in_flight| in_flight.id.as_str())
    }

    /// Append a request, replacing any earlier request with the same id.
    ///
    /// Returns `true` if an in-flight request with that id was abandoned, in
    /// which case the caller should try to cancel it on the backend.
    pub(crate) fn enqueue(&mut self, id: String, source: String, responder: Responder) -> bool {
        let before = self.pending.len();
        self.pending.retain(|request| request.id != id);
        if self.pending.len() != before {
            tracing::debug!(%id, "Replacing queued request");
        }

        let abandoned = match &mut self.in_flight {
            Some(in_flight) if in_flight.id == id && in_flight.request.is_some() => {
                tracing::debug!(%id, "Abandoning in-flight request");
                in_flight.request = None;
                true
            }
            _ => false,
        };

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.pending.push_back(ExecutionRequest {
            id,
            sequence_number,
            source,
            responder,
        });
        abandoned
    }

    /// Move the head into the in-flight slot and return its id and source.
    ///
    /// Returns `None` if a request is already in flight or nothing is queued.
    pub(crate) fn start_next(&mut self) -> Option<(String, String)> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.pending.pop_front()?;
        let dispatch = (request.id.clone(), request.source.clone());
        self.in_flight = Some(InFlight {
            id: request.id.clone(),
            request: Some(request),
        });
        Some(dispatch)
    }

    /// Route a result to the in-flight request.
    pub(crate) fn complete(&mut self, response: ExecutionResponse) -> Completion {
        let Some(in_flight) = self.in_flight.take_if(|in_flight| in_flight.id == response.id) else {
            return Completion::Unexpected(match self.in_flight_id() {
                Some(expected) => {
                    format!("result for '{}' while '{expected}' is in flight", response.id)
                }
                None => format!("result for '{}' with nothing in flight", response.id),
            });
        };

        let Some(request) = in_flight.request else {
            return Completion::Abandoned;
        };

        let result = ExecutionResult::from_response(response, request.sequence_number);
        let failed = result.is_error();
        request.responder.complete(result);
        if failed {
            let discarded = self.pending.len();
            self.pending.clear();
            Completion::Failed { discarded }
        } else {
            Completion::Delivered
        }
    }

    /// Drop every queued request and abandon the in-flight one.
    pub(crate) fn clear(&mut self) -> Cleared {
        let discarded = self.pending.len();
        self.pending.clear();
        let abandoned = self
            .in_flight
            .as_mut()
            .and_then(|in_flight| in_flight.request.take().map(|_| in_flight.id.clone()));
        Cleared { discarded, abandoned }
    }

    /// The backend is gone: report a transport error to the in-flight
    /// request, forget it, and drop everything queued.
    ///
    /// Returns the number of queued requests discarded.
    pub(crate) fn fail(&mut self, description: &str) -> usize {
        if let Some(InFlight {
            request: Some(request),
            ..
        }) = self.in_flight.take()
        {
            let result = ExecutionResult::transport_failure(
                request.id.clone(),
                request.sequence_number,
                description.to_string(),
            );
            request.responder.complete(result);
        }
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }
}
