//! Engine collaborator contract.
//!
//! The serving core never does tensor math itself. It drives an [`Engine`]
//! through this trait: batched generation, single-request streaming, adapter
//! attach/detach, and draft verification for speculative decoding.

use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique request identifier.
pub type RequestId = Uuid;

/// Token identifier in the model vocabulary.
pub type TokenId = u32;

/// Tenant used when a request names none.
pub const DEFAULT_TENANT: &str = "default";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("engine resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("adapter {0} is not attached")]
    AdapterNotAttached(String),

    #[error("engine returned {got} results for {expected} requests")]
    ResultMismatch { expected: usize, got: usize },

    #[error("stream failed: {0}")]
    Stream(String),
}

/// A generation request. Not mutated once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: RequestId,

    /// Prompt text.
    pub prompt: String,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f32,

    /// LoRA adapter to apply, if any.
    pub adapter_id: Option<String>,

    /// Owner used for fairness grouping.
    pub tenant_id: String,

    /// Whether the caller consumes incremental chunks.
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            prompt: prompt.into(),
            max_tokens,
            temperature: 0.7,
            top_p: 0.95,
            adapter_id: None,
            tenant_id: DEFAULT_TENANT.to_string(),
            stream: false,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_adapter(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = Some(adapter_id.into());
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Copy of this request with a different prompt and budget, same identity.
    pub fn continuation(&self, prompt: String, max_tokens: usize) -> Self {
        Self {
            prompt,
            max_tokens,
            ..self.clone()
        }
    }
}

/// Output of a finished generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,

    /// Number of generated tokens.
    pub tokens: usize,

    /// Generated token ids, when the engine reports them.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub token_ids: Vec<TokenId>,

    /// Probability the engine assigned to each generated token.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub token_probs: Vec<f32>,
}

/// A draft proposal handed to the target engine for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyRequest {
    pub request_id: RequestId,
    pub prompt: String,
    pub adapter_id: Option<String>,

    /// Proposed continuation.
    pub proposed: Vec<TokenId>,

    /// Draft probability of each proposed token.
    pub draft_probs: Vec<f32>,
}

/// The target engine's view of each proposed position.
///
/// All vectors are indexed by proposal position and have the proposal's length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenScores {
    /// The token the target itself would pick at each position.
    pub target_tokens: Vec<TokenId>,

    /// Target probability of the proposed token at each position.
    pub target_probs: Vec<f32>,

    /// Decoded text of the proposed token at each position.
    pub pieces: Vec<String>,
}

impl TokenScores {
    pub fn len(&self) -> usize {
        self.target_tokens
            .len()
            .min(self.target_probs.len())
            .min(self.pieces.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one propose/verify round for a single request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyResult {
    /// Proposal length.
    pub proposed: usize,

    /// Length of the accepted prefix (<= `proposed`).
    pub accepted: usize,

    /// Text of the accepted prefix only.
    pub text: String,
}

/// Lazy, finite sequence of text chunks.
pub type ChunkStream = BoxStream<'static, Result<String, EngineError>>;

/// Inference engine consumed by the scheduler and speculative orchestrator.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Idempotent initialisation hook.
    async fn warmup(&self) -> Result<(), EngineError>;

    /// Make `adapter_id` available to subsequent generation calls. Idempotent.
    async fn attach_adapter(&self, adapter_id: &str, path: &Path) -> Result<(), EngineError>;

    /// Idempotent.
    async fn detach_adapter(&self, adapter_id: &str) -> Result<(), EngineError>;

    /// One result per request, same order and length as the input.
    async fn generate_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<GenerationResult>, EngineError>;

    /// Stream text chunks for one request until natural completion.
    async fn stream_generate_single(
        &self,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, EngineError>;

    /// Score each proposal; one entry per request, same order.
    async fn verify_batch(&self, requests: &[VerifyRequest])
        -> Result<Vec<TokenScores>, EngineError>;
}
