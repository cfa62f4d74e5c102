//! Prometheus metrics.
//!
//! Each [`ServeMetrics`] owns its registry, so several services (or tests) in
//! one process never collide on metric names.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::adapters::AdapterStats;
use crate::kv_cache::KvStats;
use crate::speculative::RoundTally;

const LATENCY_BUCKETS_MS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0];

/// Label used for requests that name no adapter.
pub const BASE_ADAPTER_LABEL: &str = "base";

/// Label used for requests refused at admission, whatever adapter they named.
pub const REJECTED_ADAPTER_LABEL: &str = "rejected";

#[derive(Clone)]
pub struct ServeMetrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub request_latency_ms: HistogramVec,
    pub ttft_ms: Histogram,
    pub batch_size: Histogram,
    pub queue_wait_ms: Histogram,
    pub tokens_generated_total: IntCounterVec,
    pub request_failures_total: IntCounterVec,
    pub batch_closes_total: IntCounterVec,

    pub queue_depth: IntGauge,
    pub kv_used_blocks: IntGauge,
    pub kv_free_blocks: IntGauge,
    pub adapters_resident: IntGauge,

    pub spec_rounds_total: IntCounter,
    pub spec_proposed_total: IntCounter,
    pub spec_accepted_total: IntCounter,
}

impl ServeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("lora_serve_requests_total", "Requests received"),
            &["endpoint", "adapter_id"],
        )?;
        let request_latency_ms = HistogramVec::new(
            HistogramOpts::new("lora_serve_request_latency_ms", "End-to-end request latency")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["endpoint"],
        )?;
        let ttft_ms = Histogram::with_opts(
            HistogramOpts::new("lora_serve_ttft_ms", "Time to first streamed chunk")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("lora_serve_batch_size", "Entries per dispatched engine batch")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
        )?;
        let queue_wait_ms = Histogram::with_opts(
            HistogramOpts::new("lora_serve_queue_wait_ms", "Time from enqueue to dispatch")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
        )?;
        let tokens_generated_total = IntCounterVec::new(
            Opts::new("lora_serve_tokens_generated_total", "Generated tokens"),
            &["endpoint"],
        )?;
        let request_failures_total = IntCounterVec::new(
            Opts::new("lora_serve_request_failures_total", "Requests resolved with an error"),
            &["kind"],
        )?;
        let batch_closes_total = IntCounterVec::new(
            Opts::new("lora_serve_batch_closes_total", "Why batch formation stopped"),
            &["reason"],
        )?;
        let queue_depth = IntGauge::new("lora_serve_queue_depth", "Entries waiting in tenant queues")?;
        let kv_used_blocks = IntGauge::new("lora_serve_kv_used_blocks", "Reserved KV blocks")?;
        let kv_free_blocks = IntGauge::new("lora_serve_kv_free_blocks", "Free KV blocks")?;
        let adapters_resident =
            IntGauge::new("lora_serve_adapters_resident", "Adapters attached to the engine")?;
        let spec_rounds_total =
            IntCounter::new("lora_serve_spec_rounds_total", "Speculative propose/verify rounds")?;
        let spec_proposed_total =
            IntCounter::new("lora_serve_spec_proposed_tokens_total", "Draft tokens proposed")?;
        let spec_accepted_total =
            IntCounter::new("lora_serve_spec_accepted_tokens_total", "Draft tokens accepted")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_latency_ms.clone()))?;
        registry.register(Box::new(ttft_ms.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(queue_wait_ms.clone()))?;
        registry.register(Box::new(tokens_generated_total.clone()))?;
        registry.register(Box::new(request_failures_total.clone()))?;
        registry.register(Box::new(batch_closes_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(kv_used_blocks.clone()))?;
        registry.register(Box::new(kv_free_blocks.clone()))?;
        registry.register(Box::new(adapters_resident.clone()))?;
        registry.register(Box::new(spec_rounds_total.clone()))?;
        registry.register(Box::new(spec_proposed_total.clone()))?;
        registry.register(Box::new(spec_accepted_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency_ms,
            ttft_ms,
            batch_size,
            queue_wait_ms,
            tokens_generated_total,
            request_failures_total,
            batch_closes_total,
            queue_depth,
            kv_used_blocks,
            kv_free_blocks,
            adapters_resident,
            spec_rounds_total,
            spec_proposed_total,
            spec_accepted_total,
        })
    }

    pub fn record_request(&self, endpoint: &str, adapter_id: Option<&str>) {
        self.requests_total
            .with_label_values(&[endpoint, adapter_id.unwrap_or(BASE_ADAPTER_LABEL)])
            .inc();
    }

    pub fn record_rejected(&self, endpoint: &str) {
        self.requests_total
            .with_label_values(&[endpoint, REJECTED_ADAPTER_LABEL])
            .inc();
    }

    pub fn record_kv(&self, stats: &KvStats) {
        self.kv_used_blocks.set(stats.used_blocks as i64);
        self.kv_free_blocks.set(stats.free_blocks as i64);
    }

    pub fn record_adapters(&self, stats: &AdapterStats) {
        self.adapters_resident.set(stats.resident as i64);
    }

    pub fn record_speculative(&self, tally: &RoundTally) {
        self.spec_rounds_total.inc_by(tally.rounds);
        self.spec_proposed_total.inc_by(tally.proposed);
        self.spec_accepted_total.inc_by(tally.accepted);
    }

    /// Content type of [`encode`](Self::encode) output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Render every metric in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for ServeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeMetrics").finish_non_exhaustive()
    }
}
