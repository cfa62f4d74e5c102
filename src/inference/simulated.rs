//! Deterministic engine that honours the [`Engine`] contract without a model.
//!
//! Token `i` of a completion is derived from a hash of the prompt, so a draft
//! and a target instance agree on every position unless the draft is told to
//! diverge. Failure injection and a dispatch gate let tests drive the
//! scheduler through error and backpressure paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info};

use crate::inference::engine::{
    ChunkStream, Engine, EngineError, GenerationRequest, GenerationResult, RequestId, TokenId,
    TokenScores, VerifyRequest,
};

const VOCAB_SIZE: u64 = 32_000;
const DEFAULT_MAX_OUTPUT_TOKENS: usize = 32;
const AGREE_PROB: f32 = 0.9;
const DISAGREE_PROB: f32 = 0.02;
const DRAFT_PROB: f32 = 0.8;

/// Text of a single token.
pub fn piece(token: TokenId) -> String {
    format!("tok{token} ")
}

/// The token the simulated model picks at `position` after `prompt`.
pub fn token_at(prompt: &str, position: usize) -> TokenId {
    // FNV-1a
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in prompt.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash.wrapping_add(position as u64) % VOCAB_SIZE) as TokenId
}

pub struct SimulatedEngine {
    model_id: String,
    adapters: RwLock<HashMap<String, PathBuf>>,
    max_output_tokens: usize,
    chunk_delay: Duration,
    /// Proposal position at which this engine picks a different token.
    diverge_at: Option<usize>,
    pending_failures: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    batch_log: Mutex<Vec<Vec<RequestId>>>,
    warmups: AtomicUsize,
}

impl SimulatedEngine {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            adapters: RwLock::new(HashMap::new()),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            chunk_delay: Duration::ZERO,
            diverge_at: None,
            pending_failures: AtomicUsize::new(0),
            gate: None,
            batch_log: Mutex::new(Vec::new()),
            warmups: AtomicUsize::new(0),
        }
    }

    /// Cap on generated tokens per request.
    pub fn with_max_output_tokens(mut self, max: usize) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// Delay between streamed chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Pick a different token at this completion position (draft role).
    pub fn diverging_at(mut self, position: usize) -> Self {
        self.diverge_at = Some(position);
        self
    }

    /// Every `generate_batch` call takes one permit before returning.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail the next `count` calls to `generate_batch`.
    pub fn fail_next_batches(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Request ids of every batch seen so far, in dispatch order.
    pub fn batch_log(&self) -> Vec<Vec<RequestId>> {
        self.batch_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn warmup_count(&self) -> usize {
        self.warmups.load(Ordering::SeqCst)
    }

    pub async fn attached_adapters(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn token(&self, prompt: &str, position: usize) -> TokenId {
        let token = token_at(prompt, position);
        if self.diverge_at == Some(position) {
            (token + 1) % VOCAB_SIZE as TokenId
        } else {
            token
        }
    }

    async fn check_adapter(&self, adapter_id: Option<&str>) -> Result<(), EngineError> {
        match adapter_id {
            Some(id) if !self.adapters.read().await.contains_key(id) => {
                Err(EngineError::AdapterNotAttached(id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn complete(&self, request: &GenerationRequest) -> GenerationResult {
        let n = request.max_tokens.min(self.max_output_tokens);
        let token_ids: Vec<TokenId> = (0..n).map(|i| self.token(&request.prompt, i)).collect();
        let text = token_ids.iter().map(|t| piece(*t)).collect();
        GenerationResult {
            text,
            tokens: n,
            token_probs: vec![DRAFT_PROB; n],
            token_ids,
        }
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    async fn warmup(&self) -> Result<(), EngineError> {
        self.warmups.fetch_add(1, Ordering::SeqCst);
        info!(model = %self.model_id, "Simulated engine warmed up");
        Ok(())
    }

    async fn attach_adapter(&self, adapter_id: &str, path: &Path) -> Result<(), EngineError> {
        self.adapters
            .write()
            .await
            .insert(adapter_id.to_string(), path.to_path_buf());
        debug!(adapter_id, path = %path.display(), "Adapter attached");
        Ok(())
    }

    async fn detach_adapter(&self, adapter_id: &str) -> Result<(), EngineError> {
        self.adapters.write().await.remove(adapter_id);
        debug!(adapter_id, "Adapter detached");
        Ok(())
    }

    async fn generate_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<GenerationResult>, EngineError> {
        if let Ok(mut log) = self.batch_log.lock() {
            log.push(requests.iter().map(|r| r.request_id).collect());
        }

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| EngineError::Inference("engine gate closed".into()))?
                .forget();
        }

        if self.take_failure() {
            return Err(EngineError::Inference("injected failure".into()));
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            self.check_adapter(request.adapter_id.as_deref()).await?;
            results.push(self.complete(request));
        }
        Ok(results)
    }

    async fn stream_generate_single(
        &self,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, EngineError> {
        self.check_adapter(request.adapter_id.as_deref()).await?;

        let chunks: Vec<String> = self.complete(request).token_ids.into_iter().map(piece).collect();
        let delay = self.chunk_delay;
        let stream = stream::iter(chunks).then(move |chunk| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        });
        Ok(stream.boxed())
    }

    async fn verify_batch(
        &self,
        requests: &[VerifyRequest],
    ) -> Result<Vec<TokenScores>, EngineError> {
        let mut scores = Vec::with_capacity(requests.len());
        for request in requests {
            self.check_adapter(request.adapter_id.as_deref()).await?;

            let mut out = TokenScores::default();
            for (position, proposed) in request.proposed.iter().enumerate() {
                let own = self.token(&request.prompt, position);
                out.target_tokens.push(own);
                out.target_probs.push(if own == *proposed {
                    AGREE_PROB
                } else {
                    DISAGREE_PROB
                });
                out.pieces.push(piece(*proposed));
            }
            scores.push(out);
        }
        Ok(scores)
    }
}
