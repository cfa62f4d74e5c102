//! Draft/verify orchestration.
//!
//! [`SpeculativeOrchestrator::round`] performs exactly one round: the draft
//! engine proposes up to `max_draft_steps` tokens per request, the target
//! engine scores every proposed position, and the acceptance policy keeps the
//! longest accepted prefix. [`SpeculativeDecoder`] is the caller that repeats
//! rounds until each request reaches `max_tokens` or the draft runs dry.

use std::sync::Arc;

use tracing::debug;

use crate::inference::{
    Engine, EngineError, GenerationRequest, GenerationResult, TokenScores, VerifyRequest,
    VerifyResult,
};
use crate::speculative::acceptance::{AcceptancePolicy, ProposedToken};

/// Draft probability assumed when the draft engine reports none.
const UNREPORTED_DRAFT_PROB: f32 = 1.0;

pub struct SpeculativeOrchestrator {
    draft: Arc<dyn Engine>,
    target: Arc<dyn Engine>,
    max_draft_steps: usize,
    policy: Arc<dyn AcceptancePolicy>,
}

impl SpeculativeOrchestrator {
    pub fn new(
        draft: Arc<dyn Engine>,
        target: Arc<dyn Engine>,
        max_draft_steps: usize,
        policy: Arc<dyn AcceptancePolicy>,
    ) -> Self {
        Self {
            draft,
            target,
            max_draft_steps: max_draft_steps.max(1),
            policy,
        }
    }

    pub fn target(&self) -> &Arc<dyn Engine> {
        &self.target
    }

    pub fn policy(&self) -> &dyn AcceptancePolicy {
        self.policy.as_ref()
    }

    /// One propose/verify round. One result per request, same order.
    pub async fn round(&self, requests: &[GenerationRequest]) -> Result<Vec<VerifyResult>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // The draft runs on the base model; adapters are attached to the target only.
        let draft_requests: Vec<GenerationRequest> = requests
            .iter()
            .map(|r| {
                let mut draft = r.continuation(r.prompt.clone(), r.max_tokens.min(self.max_draft_steps));
                draft.adapter_id = None;
                draft
            })
            .collect();

        let proposals = self.draft.generate_batch(&draft_requests).await?;
        if proposals.len() != requests.len() {
            return Err(EngineError::ResultMismatch {
                expected: requests.len(),
                got: proposals.len(),
            });
        }

        let verify: Vec<VerifyRequest> = requests
            .iter()
            .zip(draft_requests.iter())
            .zip(proposals)
            .map(|((req, draft_req), proposal)| {
                let limit = draft_req.max_tokens.min(proposal.token_ids.len());
                let mut proposed = proposal.token_ids;
                proposed.truncate(limit);
                let mut draft_probs = proposal.token_probs;
                draft_probs.resize(limit, UNREPORTED_DRAFT_PROB);
                VerifyRequest {
                    request_id: req.request_id,
                    prompt: req.prompt.clone(),
                    adapter_id: req.adapter_id.clone(),
                    proposed,
                    draft_probs,
                }
            })
            .collect();

        let scores = self.target.verify_batch(&verify).await?;
        if scores.len() != verify.len() {
            return Err(EngineError::ResultMismatch {
                expected: verify.len(),
                got: scores.len(),
            });
        }

        Ok(verify
            .iter()
            .zip(scores.iter())
            .map(|(req, scores)| self.judge(req, scores))
            .collect())
    }

    fn judge(&self, request: &VerifyRequest, scores: &TokenScores) -> VerifyResult {
        let positions: Vec<ProposedToken> = request
            .proposed
            .iter()
            .zip(request.draft_probs.iter())
            .take(scores.len())
            .enumerate()
            .map(|(i, (proposed, draft_prob))| ProposedToken {
                proposed: *proposed,
                draft_prob: *draft_prob,
                target_token: scores.target_tokens[i],
                target_prob: scores.target_probs[i],
            })
            .collect();

        let accepted = self.policy.accepted_prefix(&positions).min(positions.len());
        let text: String = scores.pieces[..accepted].concat();

        debug!(
            request_id = %request.request_id,
            proposed = request.proposed.len(),
            accepted,
            policy = self.policy.name(),
            "Verified draft proposal"
        );

        VerifyResult {
            proposed: request.proposed.len(),
            accepted,
            text,
        }
    }
}

/// Totals across the rounds of one decode call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTally {
    pub rounds: u64,
    pub proposed: u64,
    pub accepted: u64,
    /// Single target tokens generated after a fully rejected round.
    pub fallback_tokens: u64,
}

struct DecodeState {
    text: String,
    tokens: usize,
    done: bool,
}

/// Repeats rounds until every request is complete.
pub struct SpeculativeDecoder {
    orchestrator: SpeculativeOrchestrator,
}

impl SpeculativeDecoder {
    pub fn new(orchestrator: SpeculativeOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &SpeculativeOrchestrator {
        &self.orchestrator
    }

    /// Generate up to `max_tokens` per request.
    ///
    /// A round that accepts nothing is followed by one target-generated token
    /// so every round makes progress. A request whose draft proposes nothing
    /// has reached its natural end.
    pub async fn generate(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<(Vec<GenerationResult>, RoundTally), EngineError> {
        let mut states: Vec<DecodeState> = requests
            .iter()
            .map(|_| DecodeState {
                text: String::new(),
                tokens: 0,
                done: false,
            })
            .collect();
        let mut tally = RoundTally::default();

        loop {
            let active: Vec<usize> = (0..requests.len())
                .filter(|&i| !states[i].done && states[i].tokens < requests[i].max_tokens)
                .collect();
            if active.is_empty() {
                break;
            }

            let round_requests: Vec<GenerationRequest> = active
                .iter()
                .map(|&i| {
                    let req = &requests[i];
                    req.continuation(
                        format!("{}{}", req.prompt, states[i].text),
                        req.max_tokens - states[i].tokens,
                    )
                })
                .collect();

            let results = self.orchestrator.round(&round_requests).await?;
            tally.rounds += 1;

            let mut stalled = Vec::new();
            for (&i, result) in active.iter().zip(results) {
                tally.proposed += result.proposed as u64;
                tally.accepted += result.accepted as u64;
                let state = &mut states[i];
                if result.proposed == 0 {
                    state.done = true;
                } else if result.accepted == 0 {
                    stalled.push(i);
                } else {
                    state.text.push_str(&result.text);
                    state.tokens += result.accepted;
                }
            }

            if !stalled.is_empty() {
                let single: Vec<GenerationRequest> = stalled
                    .iter()
                    .map(|&i| {
                        let req = &requests[i];
                        req.continuation(format!("{}{}", req.prompt, states[i].text), 1)
                    })
                    .collect();
                let outs = self.orchestrator.target().generate_batch(&single).await?;
                if outs.len() != single.len() {
                    return Err(EngineError::ResultMismatch {
                        expected: single.len(),
                        got: outs.len(),
                    });
                }
                for (&i, out) in stalled.iter().zip(outs) {
                    let state = &mut states[i];
                    if out.tokens == 0 {
                        state.done = true;
                    } else {
                        state.text.push_str(&out.text);
                        state.tokens += out.tokens;
                        tally.fallback_tokens += out.tokens as u64;
                    }
                }
            }
        }

        let results = states
            .into_iter()
            .map(|s| GenerationResult {
                text: s.text,
                tokens: s.tokens,
                ..Default::default()
            })
            .collect();
        Ok((results, tally))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::SimulatedEngine;
    use crate::speculative::acceptance::GreedyMatch;

    fn orchestrator(draft: SimulatedEngine, target: SimulatedEngine, steps: usize) -> SpeculativeOrchestrator {
        SpeculativeOrchestrator::new(Arc::new(draft), Arc::new(target), steps, Arc::new(GreedyMatch))
    }

    #[tokio::test]
    async fn test_round_accepts_agreeing_prefix() {
        let orch = orchestrator(
            SimulatedEngine::new("draft").diverging_at(3),
            SimulatedEngine::new("target"),
            8,
        );
        let results = orch.round(&[GenerationRequest::new("hello", 16)]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].proposed, 8);
        assert_eq!(results[0].accepted, 3);
        assert_eq!(results[0].text.split_whitespace().count(), 3);
    }

    #[tokio::test]
    async fn test_round_respects_max_tokens() {
        let orch = orchestrator(SimulatedEngine::new("draft"), SimulatedEngine::new("target"), 8);
        let results = orch.round(&[GenerationRequest::new("hello", 2)]).await.unwrap();
        assert_eq!(results[0].proposed, 2);
        assert_eq!(results[0].accepted, 2);
    }

    #[tokio::test]
    async fn test_decoder_reaches_max_tokens_despite_rejections() {
        let decoder = SpeculativeDecoder::new(orchestrator(
            SimulatedEngine::new("draft").diverging_at(0),
            SimulatedEngine::new("target"),
            4,
        ));
        let (results, tally) = decoder
            .generate(&[GenerationRequest::new("hi", 5)])
            .await
            .unwrap();
        assert_eq!(results[0].tokens, 5);
        assert_eq!(tally.accepted, 0);
        assert_eq!(tally.fallback_tokens, 5);
    }

    #[tokio::test]
    async fn test_decoder_stops_when_draft_runs_dry() {
        let decoder = SpeculativeDecoder::new(orchestrator(
            SimulatedEngine::new("draft").with_max_output_tokens(0),
            SimulatedEngine::new("target"),
            4,
        ));
        let (results, tally) = decoder
            .generate(&[GenerationRequest::new("hi", 5)])
            .await
            .unwrap();
        assert_eq!(results[0].tokens, 0);
        assert_eq!(tally.rounds, 1);
    }
}
