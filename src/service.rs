//! Service context.
//!
//! [`LoraServe`] owns the tenant queues, KV allocator, adapter cache, metrics
//! and the dispatch task. It is constructed explicitly with
//! [`LoraServe::start`] and stopped with [`LoraServe::shutdown`]; request
//! handlers receive it by reference instead of reaching for process globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::adapters::{AdapterCache, AdapterStats};
use crate::config::{Config, ConfigError};
use crate::error::{ServeError, ServeResult};
use crate::inference::{Engine, EngineError, GenerationRequest, GenerationResult, RequestId};
use crate::kv_cache::{BlockAllocator, KvStats, SharedAllocator};
use crate::metrics::ServeMetrics;
use crate::scheduler::{
    BatchPolicy, BatchScheduler, CompletionHandle, QueueEntry, TenantQueues, ENDPOINT_GENERATE,
    ENDPOINT_STREAM,
};
use crate::speculative::{policy_from_config, SpeculativeDecoder, SpeculativeOrchestrator};

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("engine warmup failed: {0}")]
    Warmup(#[from] EngineError),
}

pub struct LoraServe {
    config: Arc<Config>,
    queues: Arc<TenantQueues>,
    allocator: SharedAllocator,
    adapters: Arc<AdapterCache>,
    metrics: ServeMetrics,
    speculative: bool,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    started_at: Instant,
}

impl LoraServe {
    /// Validate the configuration, warm up the engines and spawn the dispatch loop.
    ///
    /// With a `draft` engine and speculative decoding enabled, non-streaming
    /// batches run as draft/verify rounds against `engine`.
    pub async fn start(
        config: Config,
        engine: Arc<dyn Engine>,
        draft: Option<Arc<dyn Engine>>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        engine.warmup().await?;
        if let Some(draft) = &draft {
            draft.warmup().await?;
        }

        let metrics = ServeMetrics::new()?;
        let queues = Arc::new(TenantQueues::new(
            config.scheduler.tenant_weights.clone(),
            config.scheduler.default_tenant_weight,
        ));
        let allocator = Arc::new(BlockAllocator::new(
            config.kv_cache.block_tokens,
            config.kv_cache.capacity_blocks,
        ));
        let adapters = Arc::new(AdapterCache::new(
            config.adapters.root.clone(),
            config.adapters.max_loaded,
            Arc::clone(&engine),
        ));

        let mut scheduler = BatchScheduler::new(
            Arc::clone(&queues),
            Arc::clone(&allocator),
            Arc::clone(&adapters),
            Arc::clone(&engine),
            BatchPolicy::from(&config.scheduler),
            metrics.clone(),
        );

        let speculative = match draft {
            Some(draft) if config.speculative.enabled => {
                let policy = policy_from_config(&config.speculative.acceptance);
                info!(
                    max_draft_steps = config.speculative.max_draft_steps,
                    acceptance = policy.name(),
                    "Speculative decoding enabled"
                );
                let orchestrator = SpeculativeOrchestrator::new(
                    draft,
                    Arc::clone(&engine),
                    config.speculative.max_draft_steps,
                    policy,
                );
                scheduler = scheduler.with_speculative(SpeculativeDecoder::new(orchestrator));
                true
            }
            Some(_) => {
                info!("Draft engine supplied but speculative decoding is disabled");
                false
            }
            None => false,
        };

        metrics.record_kv(&allocator.stats());

        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(scheduler.run(shutdown.clone()));

        info!(
            model = %config.model.model_id,
            kv_blocks = config.kv_cache.capacity_blocks,
            block_tokens = config.kv_cache.block_tokens,
            max_adapters = config.adapters.max_loaded,
            adapter_root = %config.adapters.root.display(),
            "lora-serve started"
        );

        Ok(Self {
            config: Arc::new(config),
            queues,
            allocator,
            adapters,
            metrics,
            speculative,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
            accepting: AtomicBool::new(true),
            started_at: Instant::now(),
        })
    }

    /// Queue a request. Returns at once; admission failures resolve the handle immediately.
    pub async fn submit(&self, request: GenerationRequest) -> CompletionHandle {
        self.enqueue(request, None).await
    }

    /// Queue a streaming request. Chunks arrive on the receiver while the
    /// handle resolves with the aggregated result once the stream ends.
    pub async fn submit_streaming(
        &self,
        request: GenerationRequest,
    ) -> (CompletionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.config.server.stream_buffer.max(1));
        let handle = self.enqueue(request.streaming(), Some(tx)).await;
        (handle, rx)
    }

    /// Submit and wait for the result.
    pub async fn generate(&self, request: GenerationRequest) -> ServeResult<GenerationResult> {
        self.submit(request).await.await
    }

    async fn enqueue(
        &self,
        request: GenerationRequest,
        chunks: Option<mpsc::Sender<String>>,
    ) -> CompletionHandle {
        let endpoint = if request.stream {
            ENDPOINT_STREAM
        } else {
            ENDPOINT_GENERATE
        };
        let admitted = self.admission(&request).await;
        // Only ids that passed the path check become label values.
        match &admitted {
            Ok(_) => self
                .metrics
                .record_request(endpoint, request.adapter_id.as_deref()),
            Err(_) => self.metrics.record_rejected(endpoint),
        }
        let (mut entry, handle) = QueueEntry::new(request);
        if let Some(chunks) = chunks {
            entry = entry.with_chunks(chunks);
        }

        match admitted {
            Ok(verified) => {
                if verified {
                    entry = entry.verified();
                }
                self.queues.push(entry);
                self.metrics.queue_depth.set(self.queues.len() as i64);
                // A push that lands after shutdown drained the queues must not strand its handle.
                if !self.accepting.load(Ordering::SeqCst) {
                    self.reject_queued();
                }
            }
            Err(err) => {
                debug!(request_id = %handle.request_id(), "Request rejected at admission: {err}");
                self.metrics
                    .request_failures_total
                    .with_label_values(&[err.kind()])
                    .inc();
                entry.resolve(Err(err));
            }
        }
        handle
    }

    /// Request validation plus the adapter path check. Returns whether an adapter was verified.
    async fn admission(&self, request: &GenerationRequest) -> ServeResult<bool> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ServeError::ShuttingDown);
        }
        if request.prompt.is_empty() {
            return Err(ServeError::InvalidRequest("prompt must not be empty".into()));
        }
        if request.max_tokens == 0 {
            return Err(ServeError::InvalidRequest("max_tokens must be > 0".into()));
        }
        let sampling_ok =
            request.temperature >= 0.0 && request.top_p > 0.0 && request.top_p <= 1.0;
        if !sampling_ok {
            return Err(ServeError::InvalidRequest(
                "temperature must be >= 0 and top_p in (0, 1]".into(),
            ));
        }
        match request.adapter_id.as_deref() {
            Some(adapter_id) => {
                self.adapters.resolve_path(adapter_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove an un-dispatched request; its handle resolves as cancelled.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let cancelled = self.queues.cancel(request_id);
        if cancelled {
            self.metrics
                .request_failures_total
                .with_label_values(&[ServeError::Cancelled.kind()])
                .inc();
        }
        cancelled
    }

    /// Stop accepting work, let the in-flight batch finish, and fail everything still queued.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(pending = self.queues.len(), "Shutting down lora-serve");
        self.shutdown.cancel();

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                error!("Dispatch task ended abnormally: {e}");
            }
        }

        let rejected = self.reject_queued();
        let unloaded = self.adapters.unload_idle().await;
        self.metrics.record_adapters(&self.adapters.stats());
        info!(rejected, unloaded, "lora-serve stopped");
    }

    fn reject_queued(&self) -> usize {
        let drained = self.queues.drain();
        let count = drained.len();
        for entry in drained {
            entry.resolve(Err(ServeError::ShuttingDown));
        }
        self.metrics.queue_depth.set(0);
        count
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn speculative_enabled(&self) -> bool {
        self.speculative
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &ServeMetrics {
        &self.metrics
    }

    pub fn kv_stats(&self) -> KvStats {
        self.allocator.stats()
    }

    pub fn adapter_stats(&self) -> AdapterStats {
        self.adapters.stats()
    }

    pub fn queue_depth(&self) -> usize {
        self.queues.len()
    }

    pub fn active_tenants(&self) -> Vec<String> {
        self.queues.active_tenants()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn adapters(&self) -> &Arc<AdapterCache> {
        &self.adapters
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }
}

impl Drop for LoraServe {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LoraServe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraServe")
            .field("accepting", &self.is_accepting())
            .field("queue_depth", &self.queue_depth())
            .field("speculative", &self.speculative)
            .finish_non_exhaustive()
    }
}
