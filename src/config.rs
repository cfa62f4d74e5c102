//! Runtime configuration for lora-serve.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! All scheduling knobs (batch budget, wait window, tenant weights, KV
//! capacity, adapter residency, speculative decoding) live here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "lora-serve", about = "Multi-tenant LoRA-aware LLM serving core")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json", env = "LORA_SERVE_CONFIG")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long, env = "LORA_SERVE_LISTEN")]
    pub listen: Option<String>,

    /// Root directory holding adapter files, one entry per adapter id.
    #[arg(long, env = "LORA_SERVE_ADAPTER_ROOT")]
    pub adapter_root: Option<PathBuf>,

    /// Token budget per batch.
    #[arg(long, env = "LORA_SERVE_MAX_BATCH_TOKENS")]
    pub max_batch_tokens: Option<usize>,

    /// Batch wait window in milliseconds.
    #[arg(long, env = "LORA_SERVE_MAX_WAIT_MS")]
    pub max_wait_ms: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Base and draft model identifiers.
    pub model: ModelConfig,

    /// Batch formation and tenant fairness.
    pub scheduler: SchedulerConfig,

    /// KV block budget.
    pub kv_cache: KvCacheConfig,

    /// Adapter residency.
    pub adapters: AdapterConfig,

    /// Speculative decoding.
    pub speculative: SpeculativeConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8000").
    pub listen: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Capacity of the per-request streaming chunk channel.
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            request_timeout_secs: 300,
            stream_buffer: 32,
        }
    }
}

/// Model identifiers handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base (target) model identifier.
    pub model_id: String,

    /// Weight dtype name.
    pub dtype: String,

    /// Draft model identifier for speculative decoding.
    pub draft_model_id: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "meta-llama/Llama-3-8b".to_string(),
            dtype: "bfloat16".to_string(),
            draft_model_id: None,
        }
    }
}

/// Batch formation and fairness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum sum of estimated token costs per batch.
    pub max_batch_tokens: usize,

    /// Wait window measured from the first admitted entry's enqueue time.
    pub max_wait_ms: u64,

    /// Reject entries that waited longer than this in the queue (None = never).
    pub admission_timeout_ms: Option<u64>,

    /// Round-robin weight per tenant id.
    pub tenant_weights: HashMap<String, u32>,

    /// Weight for tenants absent from `tenant_weights`.
    pub default_tenant_weight: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_tokens: 8192,
            max_wait_ms: 10,
            admission_timeout_ms: None,
            tenant_weights: HashMap::new(),
            default_tenant_weight: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout_ms.map(Duration::from_millis)
    }
}

/// KV block budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    /// Tokens held by one block.
    pub block_tokens: usize,

    /// Total number of blocks available for in-flight requests.
    pub capacity_blocks: usize,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            block_tokens: 512,
            capacity_blocks: 4096,
        }
    }
}

/// Adapter storage and residency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Directory holding adapters addressed by id.
    pub root: PathBuf,

    /// Maximum adapters resident at once.
    pub max_loaded: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./adapters"),
            max_loaded: 8,
        }
    }
}

/// Acceptance criterion applied to each proposed draft token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcceptanceConfig {
    /// Accept while the target's own choice equals the proposed token.
    #[default]
    GreedyMatch,
    /// Accept while p_target(token) >= (1 - tolerance) * p_draft(token).
    ProbabilityRatio { tolerance: f32 },
}

/// Speculative decoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Route batches through the draft/verify orchestrator when a draft engine exists.
    pub enabled: bool,

    /// Maximum tokens the draft proposes per round.
    pub max_draft_steps: usize,

    /// Acceptance criterion.
    pub acceptance: AcceptanceConfig,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_draft_steps: 8,
            acceptance: AcceptanceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(root) = &cli.adapter_root {
            self.adapters.root = root.clone();
        }
        if let Some(tokens) = cli.max_batch_tokens {
            self.scheduler.max_batch_tokens = tokens;
        }
        if let Some(wait) = cli.max_wait_ms {
            self.scheduler.max_wait_ms = wait;
        }
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kv_cache.block_tokens == 0 {
            return Err(ConfigError::Invalid("kv_cache.block_tokens must be > 0".into()));
        }
        if self.kv_cache.capacity_blocks == 0 {
            return Err(ConfigError::Invalid("kv_cache.capacity_blocks must be > 0".into()));
        }
        if self.scheduler.max_batch_tokens == 0 {
            return Err(ConfigError::Invalid("scheduler.max_batch_tokens must be > 0".into()));
        }
        if self.adapters.max_loaded == 0 {
            return Err(ConfigError::Invalid("adapters.max_loaded must be > 0".into()));
        }
        if self.scheduler.default_tenant_weight == 0
            || self.scheduler.tenant_weights.values().any(|w| *w == 0)
        {
            return Err(ConfigError::Invalid("tenant weights must be > 0".into()));
        }
        if let AcceptanceConfig::ProbabilityRatio { tolerance } = self.speculative.acceptance {
            if !(0.0..1.0).contains(&tolerance) {
                return Err(ConfigError::Invalid(
                    "speculative.acceptance.tolerance must be in [0, 1)".into(),
                ));
            }
        }
        Ok(())
    }

    /// Total KV capacity in tokens.
    pub fn kv_capacity_tokens(&self) -> usize {
        self.kv_cache.block_tokens * self.kv_cache.capacity_blocks
    }
}
