//! lora-serve: multi-tenant LLM serving core.
//!
//! Requests enter per-tenant queues served in weighted round-robin order. A
//! single dispatch loop forms batches under a token budget and wait window,
//! pins the batch's LoRA adapter in a bounded reference-counted cache,
//! reserves KV cache blocks for every entry, and drives an inference engine
//! directly or through speculative draft/verify rounds.

pub mod adapters;
pub mod config;
pub mod error;
pub mod inference;
pub mod kv_cache;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod speculative;

pub use error::{ServeError, ServeResult};
pub use service::{LoraServe, StartError};
