//! The dispatch loop.
//!
//! Each cycle pops a first entry, grows a batch around it under the
//! [`BatchBuilder`] policy using lookahead pops, splits it per adapter and
//! dispatches each sub-batch in turn. Dispatch takes an adapter lease and one
//! KV reservation per entry, calls the engine with no cache or allocator lock
//! held, returns both before resolving any handle. Errors stay local to the
//! sub-batch that raised them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterCache, AdapterError, AdapterLease};
use crate::error::ServeError;
use crate::inference::{Engine, EngineError, GenerationRequest, GenerationResult};
use crate::kv_cache::{ReservationGuard, SharedAllocator};
use crate::metrics::ServeMetrics;
use crate::scheduler::policy::{Batch, BatchBuilder, BatchPolicy, CloseReason};
use crate::scheduler::queue::{Lookahead, TenantQueues};
use crate::scheduler::request::QueueEntry;
use crate::speculative::SpeculativeDecoder;

/// Upper bound on one idle wait before the loop re-checks its queues.
const IDLE_POLL: Duration = Duration::from_millis(250);

pub const ENDPOINT_GENERATE: &str = "generate";
pub const ENDPOINT_STREAM: &str = "generate_stream";

pub struct BatchScheduler {
    queues: Arc<TenantQueues>,
    allocator: SharedAllocator,
    adapters: Arc<AdapterCache>,
    engine: Arc<dyn Engine>,
    speculative: Option<SpeculativeDecoder>,
    policy: BatchPolicy,
    metrics: ServeMetrics,
}

impl BatchScheduler {
    pub fn new(
        queues: Arc<TenantQueues>,
        allocator: SharedAllocator,
        adapters: Arc<AdapterCache>,
        engine: Arc<dyn Engine>,
        policy: BatchPolicy,
        metrics: ServeMetrics,
    ) -> Self {
        Self {
            queues,
            allocator,
            adapters,
            engine,
            speculative: None,
            policy,
            metrics,
        }
    }

    /// Route non-streaming batches through draft/verify rounds.
    pub fn with_speculative(mut self, decoder: SpeculativeDecoder) -> Self {
        self.speculative = Some(decoder);
        self
    }

    /// Run until `shutdown` fires. A batch already dispatched always finishes;
    /// entries popped for a batch that never dispatched resolve as shutting down.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            max_batch_tokens = self.policy.max_batch_tokens,
            max_wait_ms = self.policy.max_wait.as_millis() as u64,
            speculative = self.speculative.is_some(),
            "Batch scheduler started"
        );

        loop {
            let batches = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batches = self.next_batch() => batches,
            };
            for batch in batches {
                self.dispatch(batch).await;
            }
        }

        info!(pending = self.queues.len(), "Batch scheduler stopped");
    }

    /// Wait for work and form the next batch, already split per adapter.
    pub async fn next_batch(&self) -> Vec<Batch> {
        let first = self.next_entry().await;
        let mut builder = BatchBuilder::open(first, self.policy.clone(), &self.allocator);

        let reason = loop {
            if builder.is_full() {
                break if builder.is_solo() {
                    CloseReason::Solo
                } else {
                    CloseReason::BudgetExhausted
                };
            }
            match self.queues.pop_if(|c| builder.check(c, &self.allocator)) {
                Lookahead::Taken(entry) => {
                    if let Some(entry) = self.admit(entry) {
                        builder.push(entry, &self.allocator);
                    }
                }
                Lookahead::Declined(reason) => break reason,
                Lookahead::Empty => {
                    if tokio::time::Instant::now() >= builder.deadline() {
                        break CloseReason::WaitElapsed;
                    }
                    tokio::select! {
                        _ = self.queues.ready() => {}
                        _ = tokio::time::sleep_until(builder.deadline()) => {}
                    }
                }
            }
        };

        self.metrics
            .batch_closes_total
            .with_label_values(&[reason.as_str()])
            .inc();
        self.metrics.queue_depth.set(self.queues.len() as i64);
        debug!(
            entries = builder.len(),
            cost = builder.cost(),
            reason = reason.as_str(),
            "Batch closed"
        );
        builder.finish()
    }

    /// First entry of a batch. Waits cooperatively while the queues are empty.
    async fn next_entry(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.queues.pop_any() {
                if let Some(entry) = self.admit(entry) {
                    return entry;
                }
                continue;
            }
            self.metrics.queue_depth.set(0);
            tokio::select! {
                _ = self.queues.ready() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    /// Admission checks applied at pop time. Rejected entries are resolved here.
    fn admit(&self, entry: QueueEntry) -> Option<QueueEntry> {
        if let Some(deadline) = self.policy.admission_timeout {
            let waited = entry.waited();
            if waited > deadline {
                warn!(
                    request_id = %entry.request_id(),
                    tenant = %entry.tenant(),
                    waited_ms = waited.as_millis() as u64,
                    "Admission deadline exceeded"
                );
                self.fail(
                    entry,
                    ServeError::AdmissionTimeout {
                        waited_ms: waited.as_millis() as u64,
                        deadline_ms: deadline.as_millis() as u64,
                    },
                );
                return None;
            }
        }

        if !self.allocator.fits_empty(entry.cost) {
            let needed = self.allocator.blocks_for(entry.cost);
            warn!(
                request_id = %entry.request_id(),
                needed_blocks = needed,
                capacity_blocks = self.allocator.capacity_blocks(),
                "Request can never fit in the KV pool"
            );
            let capacity = self.allocator.capacity_blocks();
            self.fail(
                entry,
                ServeError::CapacityExceeded(format!(
                    "request needs {needed} KV blocks, pool holds {capacity}"
                )),
            );
            return None;
        }

        Some(entry)
    }

    /// Execute one single-adapter batch and resolve every entry in it.
    pub async fn dispatch(&self, batch: Batch) {
        let Batch {
            adapter_id,
            entries,
        } = batch;
        let mut entries: Vec<QueueEntry> = entries
            .into_iter()
            .filter(|e| {
                let gone = e.completer.is_abandoned();
                if gone {
                    debug!(request_id = %e.request_id(), "Dropping abandoned entry at dispatch");
                }
                !gone
            })
            .collect();
        if entries.is_empty() {
            return;
        }

        self.metrics.batch_size.observe(entries.len() as f64);
        for entry in &entries {
            self.metrics
                .queue_wait_ms
                .observe(entry.waited().as_secs_f64() * 1000.0);
        }

        let lease = match self.lease(adapter_id.as_deref()).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(adapter_id = ?adapter_id, entries = entries.len(), "Adapter unavailable: {err}");
                for entry in entries {
                    let outcome = adapter_failure(&entry, &err);
                    self.fail(entry, outcome);
                }
                return;
            }
        };

        let guards: Result<Vec<ReservationGuard>, _> = entries
            .iter()
            .map(|e| {
                self.allocator
                    .reserve_guard(&e.request_id().to_string(), e.cost)
            })
            .collect();
        let guards = match guards {
            Ok(guards) => guards,
            Err(err) => {
                warn!(entries = entries.len(), "KV reservation refused for batch: {err}");
                drop(lease);
                let err = ServeError::from(err);
                for entry in entries {
                    self.fail(entry, err.clone());
                }
                return;
            }
        };
        self.metrics.record_kv(&self.allocator.stats());

        let streaming = entries.len() == 1 && entries[0].is_streaming();
        let requests: Vec<GenerationRequest> = entries.iter().map(|e| e.request.clone()).collect();
        info!(
            adapter_id = ?adapter_id,
            entries = requests.len(),
            blocks = guards.iter().map(ReservationGuard::blocks).sum::<usize>(),
            streaming,
            "Dispatching batch"
        );

        let call = async {
            if streaming {
                let chunks = entries[0].chunks.take();
                self.stream(&requests[0], chunks).await.map(|r| vec![r])
            } else {
                self.generate(&requests).await
            }
        };
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Inference("engine call panicked".into())),
        };
        let outcome = outcome.and_then(|results| {
            if results.len() == entries.len() {
                Ok(results)
            } else {
                Err(EngineError::ResultMismatch {
                    expected: entries.len(),
                    got: results.len(),
                })
            }
        });

        // Resources go back before any caller observes its result.
        drop(guards);
        drop(lease);
        self.metrics.record_kv(&self.allocator.stats());
        self.metrics.record_adapters(&self.adapters.stats());

        let endpoint = if streaming { ENDPOINT_STREAM } else { ENDPOINT_GENERATE };
        match outcome {
            Ok(results) => {
                for (entry, result) in entries.into_iter().zip(results) {
                    self.metrics
                        .tokens_generated_total
                        .with_label_values(&[endpoint])
                        .inc_by(result.tokens as u64);
                    debug!(request_id = %entry.request_id(), tokens = result.tokens, "Request completed");
                    entry.resolve(Ok(result));
                }
            }
            Err(err) => {
                error!(adapter_id = ?adapter_id, entries = entries.len(), "Batch failed: {err}");
                let err = ServeError::Engine(err);
                for entry in entries {
                    self.fail(entry, err.clone());
                }
            }
        }
    }

    async fn lease(&self, adapter_id: Option<&str>) -> Result<Option<AdapterLease>, AdapterError> {
        match adapter_id {
            Some(id) => self.adapters.ensure_loaded(id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn generate(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<GenerationResult>, EngineError> {
        match &self.speculative {
            Some(decoder) => {
                let (results, tally) = decoder.generate(requests).await?;
                self.metrics.record_speculative(&tally);
                debug!(
                    rounds = tally.rounds,
                    proposed = tally.proposed,
                    accepted = tally.accepted,
                    "Speculative batch finished"
                );
                Ok(results)
            }
            None => self.engine.generate_batch(requests).await,
        }
    }

    /// Drain the engine stream to completion, forwarding chunks while the receiver listens.
    async fn stream(
        &self,
        request: &GenerationRequest,
        mut chunks: Option<mpsc::Sender<String>>,
    ) -> Result<GenerationResult, EngineError> {
        let started = tokio::time::Instant::now();
        let mut stream = self.engine.stream_generate_single(request).await?;
        let mut text = String::new();
        let mut tokens = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if tokens == 0 {
                self.metrics
                    .ttft_ms
                    .observe(started.elapsed().as_secs_f64() * 1000.0);
            }
            tokens += 1;
            text.push_str(&chunk);
            if let Some(tx) = &chunks {
                if tx.send(chunk).await.is_err() {
                    debug!(request_id = %request.request_id, "Stream receiver gone, draining");
                    chunks = None;
                }
            }
        }

        Ok(GenerationResult {
            text,
            tokens,
            ..Default::default()
        })
    }

    fn fail(&self, entry: QueueEntry, err: ServeError) {
        self.metrics
            .request_failures_total
            .with_label_values(&[err.kind()])
            .inc();
        entry.resolve(Err(err));
    }
}

/// Outcome for one entry whose adapter could not be leased.
///
/// An adapter whose path was confirmed at admission but is gone at dispatch
/// was removed in between: that is a cache race, not a missing adapter.
fn adapter_failure(entry: &QueueEntry, err: &AdapterError) -> ServeError {
    match err {
        AdapterError::NotFound { adapter_id, .. } if entry.adapter_verified => {
            ServeError::CacheRace(adapter_id.clone())
        }
        other => ServeError::from(other.clone()),
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("policy", &self.policy)
            .field("speculative", &self.speculative.is_some())
            .finish_non_exhaustive()
    }
}
