//! Queue entries and completion handles.
//!
//! A [`CompletionHandle`] is the caller's half of a single-assignment slot; the
//! [`Completer`] travels with the queued request. The completer resolves the
//! slot exactly once: explicitly through [`Completer::resolve`], or with
//! [`ServeError::ShuttingDown`] if it is dropped unresolved.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::ServeError;
use crate::inference::{GenerationRequest, GenerationResult, RequestId};
use crate::scheduler::policy::estimate_cost;

/// Final outcome delivered to a caller.
pub type Completion = Result<GenerationResult, ServeError>;

/// Awaitable result of a submitted request.
#[derive(Debug)]
pub struct CompletionHandle {
    request_id: RequestId,
    rx: oneshot::Receiver<Completion>,
}

impl CompletionHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Future for CompletionHandle {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(ServeError::ShuttingDown)))
    }
}

/// Sending half of a completion slot.
#[derive(Debug)]
pub struct Completer {
    tx: Option<oneshot::Sender<Completion>>,
}

impl Completer {
    /// Create a connected completer/handle pair.
    pub fn pair(request_id: RequestId) -> (Completer, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx: Some(tx) }, CompletionHandle { request_id, rx })
    }

    /// Deliver the outcome. Returns false if the caller already went away.
    pub fn resolve(mut self, outcome: Completion) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Whether the caller dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(ServeError::ShuttingDown));
        }
    }
}

/// A pending request owned by its tenant queue until popped.
#[derive(Debug)]
pub struct QueueEntry {
    pub request: GenerationRequest,
    pub completer: Completer,
    pub enqueued_at: Instant,

    /// Estimated token cost, fixed at enqueue.
    pub cost: usize,

    /// Chunk sink for streaming requests.
    pub chunks: Option<mpsc::Sender<String>>,

    /// The adapter path was confirmed to exist at admission.
    pub adapter_verified: bool,
}

impl QueueEntry {
    pub fn new(request: GenerationRequest) -> (Self, CompletionHandle) {
        let (completer, handle) = Completer::pair(request.request_id);
        let cost = estimate_cost(&request.prompt, request.max_tokens);
        let entry = Self {
            request,
            completer,
            enqueued_at: Instant::now(),
            cost,
            chunks: None,
            adapter_verified: false,
        };
        (entry, handle)
    }

    pub fn with_chunks(mut self, chunks: mpsc::Sender<String>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn verified(mut self) -> Self {
        self.adapter_verified = true;
        self
    }

    pub fn request_id(&self) -> RequestId {
        self.request.request_id
    }

    pub fn tenant(&self) -> &str {
        &self.request.tenant_id
    }

    pub fn adapter(&self) -> Option<&str> {
        self.request.adapter_id.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.request.stream
    }

    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Resolve this entry's handle, consuming the entry.
    pub fn resolve(self, outcome: Completion) -> bool {
        self.completer.resolve(outcome)
    }
}
