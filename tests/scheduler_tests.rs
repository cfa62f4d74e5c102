//! End-to-end scheduling tests through the service context.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use lora_serve::adapters::AdapterCache;
use lora_serve::config::Config;
use lora_serve::inference::{
    ChunkStream, Engine, EngineError, GenerationRequest, GenerationResult, RequestId,
    SimulatedEngine, TokenScores, VerifyRequest,
};
use lora_serve::kv_cache::BlockAllocator;
use lora_serve::metrics::ServeMetrics;
use lora_serve::scheduler::{BatchPolicy, BatchScheduler, QueueEntry, TenantQueues};
use lora_serve::{LoraServe, ServeError};

const WAIT: Duration = Duration::from_secs(5);

fn base_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.adapters.root = root.to_path_buf();
    config.scheduler.max_wait_ms = 20;
    config
}

async fn start(config: Config, engine: Arc<SimulatedEngine>) -> Arc<LoraServe> {
    Arc::new(LoraServe::start(config, engine, None).await.unwrap())
}

/// Wait until the engine has seen at least `n` batches.
async fn wait_for_batches(engine: &SimulatedEngine, n: usize) {
    tokio::time::timeout(WAIT, async {
        while engine.batch_log().len() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("engine never saw the expected batches");
}

fn gated(name: &str) -> (Arc<SimulatedEngine>, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(SimulatedEngine::new(name).with_gate(Arc::clone(&gate)));
    (engine, gate)
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_small_request_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let max_wait = config.scheduler.max_wait();
    let serve = start(config, Arc::new(SimulatedEngine::new("sim"))).await;

    let started = tokio::time::Instant::now();
    let handle = serve
        .submit(GenerationRequest::new("hi", 8).with_tenant("t1"))
        .await;
    let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(started.elapsed() <= max_wait, "resolved after {:?}", started.elapsed());
    assert!(result.tokens <= 8);
    assert!(result.tokens > 0);
    assert_eq!(serve.kv_stats().used_blocks, 0);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_scenario_b_missing_adapter_resolves_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let serve = start(base_config(dir.path()), Arc::new(SimulatedEngine::new("sim"))).await;

    let err = serve
        .generate(GenerationRequest::new("hi", 8).with_adapter("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err, ServeError::AdapterNotFound("ghost".into()));
    assert!(!err.is_retryable());
    serve.shutdown().await;
}

#[tokio::test]
async fn test_scenario_b_at_dispatch() {
    // An entry that skipped admission still fails cleanly at dispatch.
    let dir = tempfile::tempdir().unwrap();
    let engine: Arc<dyn Engine> = Arc::new(SimulatedEngine::new("sim"));
    let queues = Arc::new(TenantQueues::default());
    let allocator = Arc::new(BlockAllocator::new(512, 16));
    let adapters = Arc::new(AdapterCache::new(dir.path(), 2, Arc::clone(&engine)));
    let scheduler = BatchScheduler::new(
        Arc::clone(&queues),
        Arc::clone(&allocator),
        adapters,
        engine,
        BatchPolicy::from(&Config::default().scheduler),
        ServeMetrics::new().unwrap(),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(shutdown.clone()));

    let (entry, handle) = QueueEntry::new(GenerationRequest::new("hi", 8).with_adapter("ghost"));
    queues.push(entry);
    let err = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap_err();
    assert_eq!(err, ServeError::AdapterNotFound("ghost".into()));
    assert_eq!(allocator.used_blocks(), 0);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_scenario_c_one_block_pool_refuses_both() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.kv_cache.block_tokens = 512;
    config.kv_cache.capacity_blocks = 1;
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(config, engine.clone()).await;

    // cost = 400 / 4 + 500 = 600 tokens -> 2 blocks each.
    let a = serve.submit(GenerationRequest::new("x".repeat(400), 500)).await;
    let b = serve.submit(GenerationRequest::new("y".repeat(400), 500)).await;

    for handle in [a, b] {
        let err = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap_err();
        assert!(matches!(err, ServeError::CapacityExceeded(_)));
        assert!(err.is_retryable());
    }
    assert!(engine.batch_log().is_empty());
    assert_eq!(serve.kv_stats().used_blocks, 0);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_scenario_c_two_block_pool_defers_second() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.kv_cache.block_tokens = 512;
    config.kv_cache.capacity_blocks = 2;
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(config, engine.clone()).await;

    let a = serve.submit(GenerationRequest::new("x".repeat(400), 500)).await;
    let b = serve.submit(GenerationRequest::new("y".repeat(400), 500)).await;
    let (ra, rb) = tokio::join!(a, b);
    assert!(ra.is_ok());
    assert!(rb.is_ok());

    // Never both in flight at once: each batch carried exactly one of them.
    let log = engine.batch_log();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|batch| batch.len() == 1));
    assert_eq!(serve.kv_stats().used_blocks, 0);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_small_requests_coalesce() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.scheduler.max_wait_ms = 200;
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(config, engine.clone()).await;

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(
            serve
                .submit(GenerationRequest::new(format!("p{i}"), 4).with_tenant(format!("t{i}")))
                .await,
        );
    }
    for handle in handles {
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }

    let log = engine.batch_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].len(), 3);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_oversized_request_runs_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.scheduler.max_batch_tokens = 50;
    config.scheduler.max_wait_ms = 100;
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(config, engine.clone()).await;

    let small_a = serve.submit(GenerationRequest::new("abcd", 4)).await;
    let big = serve.submit(GenerationRequest::new("abcd", 100)).await;
    let small_b = serve.submit(GenerationRequest::new("abcd", 4)).await;
    let big_id = big.request_id();

    let (a, b, c) = tokio::join!(small_a, big, small_b);
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let log = engine.batch_log();
    let big_batch = log.iter().find(|batch| batch.contains(&big_id)).unwrap();
    assert_eq!(big_batch.len(), 1);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_interleaved_bursts_are_interleaved() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    // Each request costs 1 + 4 = 5, so every batch holds one.
    config.scheduler.max_batch_tokens = 5;
    let (engine, gate) = gated("sim");
    let serve = start(config, engine.clone()).await;

    let blocker = serve.submit(GenerationRequest::new("abcd", 4)).await;
    wait_for_batches(&engine, 1).await;

    let mut labels: Vec<(RequestId, String)> = Vec::new();
    let mut handles = Vec::new();
    for i in 0..4 {
        let h = serve
            .submit(GenerationRequest::new("abcd", 4).with_tenant("big"))
            .await;
        labels.push((h.request_id(), format!("b{i}")));
        handles.push(h);
    }
    for i in 0..2 {
        let h = serve
            .submit(GenerationRequest::new("abcd", 4).with_tenant("small"))
            .await;
        labels.push((h.request_id(), format!("s{i}")));
        handles.push(h);
    }

    gate.add_permits(100);
    blocker.await.unwrap();
    for handle in handles {
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }

    let order: Vec<String> = engine
        .batch_log()
        .into_iter()
        .skip(1)
        .flatten()
        .filter_map(|id| labels.iter().find(|(rid, _)| *rid == id).map(|(_, l)| l.clone()))
        .collect();
    assert_eq!(order, vec!["b0", "s0", "b1", "s1", "b2", "b3"]);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_same_tenant_resolves_in_push_order() {
    let dir = tempfile::tempdir().unwrap();
    for id in ["math", "code"] {
        std::fs::create_dir(dir.path().join(id)).unwrap();
    }
    let mut config = base_config(dir.path());
    config.scheduler.max_wait_ms = 100;
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(config, engine.clone()).await;

    let first = serve
        .submit(GenerationRequest::new("one", 4).with_tenant("t").with_adapter("math"))
        .await;
    let second = serve
        .submit(GenerationRequest::new("two", 4).with_tenant("t"))
        .await;
    let third = serve
        .submit(GenerationRequest::new("three", 4).with_tenant("t").with_adapter("math"))
        .await;
    let ids = [first.request_id(), second.request_id(), third.request_id()];

    let (a, b, c) = tokio::join!(first, second, third);
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let dispatched: Vec<RequestId> = engine.batch_log().into_iter().flatten().collect();
    assert_eq!(dispatched, ids.to_vec());
    serve.shutdown().await;
}

#[tokio::test]
async fn test_engine_failure_fails_batch_not_loop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(base_config(dir.path()), engine.clone()).await;

    engine.fail_next_batches(1);
    let err = serve
        .generate(GenerationRequest::new("hi", 4))
        .await
        .unwrap_err();
    assert!(matches!(err, ServeError::Engine(_)));
    assert!(err.is_retryable());
    assert_eq!(serve.kv_stats().used_blocks, 0);

    let ok = serve.generate(GenerationRequest::new("hi", 4)).await.unwrap();
    assert_eq!(ok.tokens, 4);
    serve.shutdown().await;
}

const MODE_NORMAL: u8 = 0;
const MODE_PANIC: u8 = 1;
const MODE_SHORT: u8 = 2;

/// Delegates to the simulated engine, except for one misbehaving batch call.
struct Misbehaving {
    inner: SimulatedEngine,
    next: AtomicU8,
}

impl Misbehaving {
    fn new(mode: u8) -> Self {
        Self {
            inner: SimulatedEngine::new("sim"),
            next: AtomicU8::new(mode),
        }
    }
}

#[async_trait]
impl Engine for Misbehaving {
    async fn warmup(&self) -> Result<(), EngineError> {
        self.inner.warmup().await
    }

    async fn attach_adapter(&self, adapter_id: &str, path: &Path) -> Result<(), EngineError> {
        self.inner.attach_adapter(adapter_id, path).await
    }

    async fn detach_adapter(&self, adapter_id: &str) -> Result<(), EngineError> {
        self.inner.detach_adapter(adapter_id).await
    }

    async fn generate_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<GenerationResult>, EngineError> {
        match self.next.swap(MODE_NORMAL, Ordering::SeqCst) {
            MODE_PANIC => panic!("kernel fault"),
            MODE_SHORT => Ok(Vec::new()),
            _ => self.inner.generate_batch(requests).await,
        }
    }

    async fn stream_generate_single(
        &self,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, EngineError> {
        self.inner.stream_generate_single(request).await
    }

    async fn verify_batch(
        &self,
        requests: &[VerifyRequest],
    ) -> Result<Vec<TokenScores>, EngineError> {
        self.inner.verify_batch(requests).await
    }
}

async fn assert_batch_fails_then_recovers(mode: u8, expected: EngineError) {
    let dir = tempfile::tempdir().unwrap();
    let serve = LoraServe::start(base_config(dir.path()), Arc::new(Misbehaving::new(mode)), None)
        .await
        .unwrap();

    let err = tokio::time::timeout(WAIT, serve.generate(GenerationRequest::new("hi", 4)))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ServeError::Engine(expected));
    assert_eq!(serve.kv_stats().used_blocks, 0);

    let ok = tokio::time::timeout(WAIT, serve.generate(GenerationRequest::new("again", 4)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ok.tokens, 4);
    assert_eq!(serve.kv_stats().used_blocks, 0);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_engine_panic_fails_batch_not_loop() {
    assert_batch_fails_then_recovers(
        MODE_PANIC,
        EngineError::Inference("engine call panicked".into()),
    )
    .await;
}

#[tokio::test]
async fn test_short_engine_result_fails_batch_not_loop() {
    assert_batch_fails_then_recovers(
        MODE_SHORT,
        EngineError::ResultMismatch {
            expected: 1,
            got: 0,
        },
    )
    .await;
}

#[tokio::test]
async fn test_adapter_reference_released_after_batch() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("math")).unwrap();
    let engine = Arc::new(SimulatedEngine::new("sim"));
    let serve = start(base_config(dir.path()), engine.clone()).await;

    serve
        .generate(GenerationRequest::new("hi", 4).with_adapter("math"))
        .await
        .unwrap();
    assert!(serve.adapters().is_resident("math"));
    assert_eq!(serve.adapters().refcount("math"), Some(0));

    engine.fail_next_batches(1);
    assert!(serve
        .generate(GenerationRequest::new("hi", 4).with_adapter("math"))
        .await
        .is_err());
    assert_eq!(serve.adapters().refcount("math"), Some(0));
    assert_eq!(serve.kv_stats().used_blocks, 0);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_adapter_removed_after_admission_is_cache_race() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("math")).unwrap();
    let (engine, gate) = gated("sim");
    let serve = start(base_config(dir.path()), engine.clone()).await;

    let blocker = serve.submit(GenerationRequest::new("hold", 4)).await;
    wait_for_batches(&engine, 1).await;

    let raced = serve
        .submit(GenerationRequest::new("hi", 4).with_adapter("math"))
        .await;
    std::fs::remove_dir(dir.path().join("math")).unwrap();
    gate.add_permits(100);

    blocker.await.unwrap();
    let err = tokio::time::timeout(WAIT, raced).await.unwrap().unwrap_err();
    assert_eq!(err, ServeError::CacheRace("math".into()));
    assert!(err.is_retryable());
    serve.shutdown().await;
}

#[tokio::test]
async fn test_cancel_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, gate) = gated("sim");
    let serve = start(base_config(dir.path()), engine.clone()).await;

    let blocker = serve.submit(GenerationRequest::new("hold", 4)).await;
    wait_for_batches(&engine, 1).await;

    let queued = serve.submit(GenerationRequest::new("hi", 4)).await;
    assert!(serve.cancel(queued.request_id()));
    assert_eq!(queued.await.unwrap_err(), ServeError::Cancelled);

    gate.add_permits(100);
    blocker.await.unwrap();
    assert_eq!(engine.batch_log().len(), 1);
    serve.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_request_is_not_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, gate) = gated("sim");
    let serve = start(base_config(dir.path()), engine.clone()).await;

    let blocker = serve.submit(GenerationRequest::new("hold", 4)).await;
    wait_for_batches(&engine, 1).await;

    let abandoned = serve.submit(GenerationRequest::new("gone", 4)).await;
    let abandoned_id = abandoned.request_id();
    drop(abandoned);
    let kept = serve.submit(GenerationRequest::new("kept", 4)).await;

    gate.add_permits(100);
    blocker.await.unwrap();
    kept.await.unwrap();

    let dispatched: Vec<RequestId> = engine.batch_log().into_iter().flatten().collect();
    assert!(!dispatched.contains(&abandoned_id));
    serve.shutdown().await;
}

#[tokio::test]
async fn test_admission_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.scheduler.admission_timeout_ms = Some(10);
    let (engine, gate) = gated("sim");
    let serve = start(config, engine.clone()).await;

    let blocker = serve.submit(GenerationRequest::new("hold", 4)).await;
    wait_for_batches(&engine, 1).await;

    let late = serve.submit(GenerationRequest::new("late", 4)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(100);

    blocker.await.unwrap();
    let err = tokio::time::timeout(WAIT, late).await.unwrap().unwrap_err();
    assert!(matches!(err, ServeError::AdmissionTimeout { deadline_ms: 10, .. }));
    serve.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_and_fails_queued() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, gate) = gated("sim");
    let serve = start(base_config(dir.path()), engine.clone()).await;

    let in_flight = serve.submit(GenerationRequest::new("running", 4)).await;
    wait_for_batches(&engine, 1).await;
    let queued = serve.submit(GenerationRequest::new("waiting", 4)).await;

    let stopper = {
        let serve = Arc::clone(&serve);
        tokio::spawn(async move { serve.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(100);
    stopper.await.unwrap();

    assert!(in_flight.await.is_ok());
    assert_eq!(queued.await.unwrap_err(), ServeError::ShuttingDown);
    assert_eq!(serve.queue_depth(), 0);
    assert_eq!(serve.kv_stats().used_blocks, 0);
}

#[tokio::test]
async fn test_streaming_forwards_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(SimulatedEngine::new("sim").with_chunk_delay(Duration::from_millis(1)));
    let serve = start(base_config(dir.path()), engine).await;

    let (handle, mut rx) = serve
        .submit_streaming(GenerationRequest::new("stream me", 6))
        .await;
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    let result = handle.await.unwrap();
    assert_eq!(chunks.len(), 6);
    assert_eq!(result.tokens, 6);
    assert_eq!(result.text, chunks.concat());
    serve.shutdown().await;
}

#[tokio::test]
async fn test_speculative_path_through_service() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.speculative.max_draft_steps = 4;
    let target = Arc::new(SimulatedEngine::new("target"));
    let draft: Arc<dyn Engine> = Arc::new(SimulatedEngine::new("draft").diverging_at(2));
    let serve = Arc::new(
        LoraServe::start(config, target, Some(draft))
            .await
            .unwrap(),
    );
    assert!(serve.speculative_enabled());

    let result = serve
        .generate(GenerationRequest::new("speculate", 10))
        .await
        .unwrap();
    assert_eq!(result.tokens, 10);
    let metrics = serve.metrics();
    assert!(metrics.spec_proposed_total.get() > 0);
    assert!(metrics.spec_accepted_total.get() > 0);
    assert!(metrics.spec_accepted_total.get() < metrics.spec_proposed_total.get());
    serve.shutdown().await;
}
