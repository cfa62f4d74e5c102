//! Speculative (draft + verify) decoding.
//!
//! - [`acceptance`]: pluggable per-token acceptance criteria
//! - [`orchestrator`]: one propose/verify round, and the decoder that iterates rounds

pub mod acceptance;
pub mod orchestrator;

pub use acceptance::{policy_from_config, AcceptancePolicy, GreedyMatch, ProbabilityRatio, ProposedToken};
pub use orchestrator::{RoundTally, SpeculativeDecoder, SpeculativeOrchestrator};
