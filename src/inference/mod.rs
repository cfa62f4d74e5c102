//! LLM inference boundary.
//!
//! - [`engine`]: Engine trait and the request/result types crossing it
//! - [`simulated`]: Deterministic engine used by the binary and tests

pub mod engine;
pub mod simulated;

pub use engine::{
    ChunkStream, Engine, EngineError, GenerationRequest, GenerationResult, RequestId, TokenId,
    TokenScores, VerifyRequest, VerifyResult, DEFAULT_TENANT,
};
pub use simulated::SimulatedEngine;
