//! Acceptance criteria for draft tokens.
//!
//! A proposal is accepted position by position and stops at the first
//! rejection; everything after it is discarded.

use std::fmt;
use std::sync::Arc;

use crate::config::AcceptanceConfig;
use crate::inference::TokenId;

/// Everything known about one proposed position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposedToken {
    pub proposed: TokenId,
    pub draft_prob: f32,
    pub target_token: TokenId,
    pub target_prob: f32,
}

pub trait AcceptancePolicy: Send + Sync + fmt::Debug {
    fn accepts(&self, token: &ProposedToken) -> bool;

    fn name(&self) -> &'static str;

    /// Length of the accepted prefix.
    fn accepted_prefix(&self, tokens: &[ProposedToken]) -> usize {
        tokens.iter().take_while(|t| self.accepts(t)).count()
    }
}

/// Accept while the target's own choice equals the proposal.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyMatch;

impl AcceptancePolicy for GreedyMatch {
    fn accepts(&self, token: &ProposedToken) -> bool {
        token.proposed == token.target_token
    }

    fn name(&self) -> &'static str {
        "greedy_match"
    }
}

/// Accept while `p_target >= (1 - tolerance) * p_draft`.
///
/// With tolerance 0 this is the deterministic form of the `min(1, p/q)` test:
/// a token survives only where the target is at least as confident as the draft.
#[derive(Debug, Clone, Copy)]
pub struct ProbabilityRatio {
    pub tolerance: f32,
}

impl AcceptancePolicy for ProbabilityRatio {
    fn accepts(&self, token: &ProposedToken) -> bool {
        let floor = (1.0 - self.tolerance.clamp(0.0, 1.0)) * token.draft_prob;
        token.target_prob.is_finite() && token.target_prob >= floor
    }

    fn name(&self) -> &'static str {
        "probability_ratio"
    }
}

pub fn policy_from_config(config: &AcceptanceConfig) -> Arc<dyn AcceptancePolicy> {
    match config {
        AcceptanceConfig::GreedyMatch => Arc::new(GreedyMatch),
        AcceptanceConfig::ProbabilityRatio { tolerance } => Arc::new(ProbabilityRatio {
            tolerance: *tolerance,
        }),
    }
}
