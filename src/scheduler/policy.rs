//! Batch formation policy.
//!
//! A batch opens with one entry and admits further candidates while
//! - the running token cost plus the candidate's stays within `max_batch_tokens`,
//! - the candidate arrived within `max_wait` of the first entry,
//! - the candidate's KV blocks still fit in the allocator's free blocks,
//! - admitting it cannot make a tenant's later request resolve before an earlier one.
//!
//! Streaming requests always travel alone. The admitted set is later split
//! into one sub-batch per adapter, in order of first appearance.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::kv_cache::BlockAllocator;
use crate::scheduler::request::QueueEntry;

/// Heuristic token cost: `max(1, prompt_chars / 4) + max(1, max_tokens)`.
pub fn estimate_cost(prompt: &str, max_tokens: usize) -> usize {
    (prompt.chars().count() / 4).max(1) + max_tokens.max(1)
}

/// Why a batch stopped admitting entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The next candidate would overflow the token budget.
    BudgetExhausted,
    /// The wait window elapsed.
    WaitElapsed,
    /// The next candidate's KV blocks do not fit.
    KvPressure,
    /// The next candidate would reorder its tenant's completions.
    TenantOrder,
    /// Streaming or over-budget entries are dispatched alone.
    Solo,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::BudgetExhausted => "budget",
            CloseReason::WaitElapsed => "wait",
            CloseReason::KvPressure => "kv_pressure",
            CloseReason::TenantOrder => "tenant_order",
            CloseReason::Solo => "solo",
        }
    }
}

/// Static limits for forming batches.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub max_batch_tokens: usize,
    pub max_wait: Duration,
    pub admission_timeout: Option<Duration>,
}

impl From<&SchedulerConfig> for BatchPolicy {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            max_batch_tokens: cfg.max_batch_tokens,
            max_wait: cfg.max_wait(),
            admission_timeout: cfg.admission_timeout(),
        }
    }
}

/// An ordered set of entries that share one adapter requirement.
#[derive(Debug)]
pub struct Batch {
    pub adapter_id: Option<String>,
    pub entries: Vec<QueueEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_cost(&self) -> usize {
        self.entries.iter().map(|e| e.cost).sum()
    }
}

/// Accumulates entries for one batch.
#[derive(Debug)]
pub struct BatchBuilder {
    policy: BatchPolicy,
    entries: Vec<QueueEntry>,
    cost: usize,
    blocks: usize,
    free_blocks: usize,
    deadline: Instant,
    solo: bool,
    /// Adapters in order of first appearance.
    groups: Vec<Option<String>>,
    /// Highest adapter group index admitted per tenant.
    tenant_group: HashMap<String, usize>,
}

impl BatchBuilder {
    /// Open a batch with `first`, sized against the allocator's current free blocks.
    pub fn open(first: QueueEntry, policy: BatchPolicy, allocator: &BlockAllocator) -> Self {
        let deadline = first.enqueued_at + policy.max_wait;
        let solo = first.is_streaming() || first.cost > policy.max_batch_tokens;
        let mut builder = Self {
            policy,
            entries: Vec::new(),
            cost: 0,
            blocks: 0,
            free_blocks: allocator.free_blocks(),
            deadline,
            solo,
            groups: Vec::new(),
            tenant_group: HashMap::new(),
        };
        let blocks = allocator.blocks_for(first.cost);
        builder.admit(first, blocks);
        builder
    }

    /// Instant after which no further arrivals are admitted.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Streaming or over-budget first entry.
    pub fn is_solo(&self) -> bool {
        self.solo
    }

    /// Whether the batch can take nothing more regardless of candidates.
    pub fn is_full(&self) -> bool {
        self.solo || self.cost >= self.policy.max_batch_tokens
    }

    fn group_of(&self, adapter: Option<&str>) -> usize {
        self.groups
            .iter()
            .position(|g| g.as_deref() == adapter)
            .unwrap_or(self.groups.len())
    }

    /// Decide whether `candidate` may join without removing it from its queue.
    pub fn check(&self, candidate: &QueueEntry, allocator: &BlockAllocator) -> Result<(), CloseReason> {
        if self.solo || candidate.is_streaming() {
            return Err(CloseReason::Solo);
        }
        if candidate.enqueued_at >= self.deadline {
            return Err(CloseReason::WaitElapsed);
        }
        if self.cost + candidate.cost > self.policy.max_batch_tokens {
            return Err(CloseReason::BudgetExhausted);
        }
        if self.blocks + allocator.blocks_for(candidate.cost) > self.free_blocks {
            return Err(CloseReason::KvPressure);
        }
        let group = self.group_of(candidate.adapter());
        if let Some(highest) = self.tenant_group.get(candidate.tenant()) {
            if *highest > group {
                return Err(CloseReason::TenantOrder);
            }
        }
        Ok(())
    }

    /// Add an entry that passed [`check`](Self::check).
    pub fn push(&mut self, entry: QueueEntry, allocator: &BlockAllocator) {
        let blocks = allocator.blocks_for(entry.cost);
        self.admit(entry, blocks);
    }

    fn admit(&mut self, entry: QueueEntry, blocks: usize) {
        let group = self.group_of(entry.adapter());
        if group == self.groups.len() {
            self.groups.push(entry.request.adapter_id.clone());
        }
        let highest = self
            .tenant_group
            .entry(entry.tenant().to_string())
            .or_insert(group);
        *highest = (*highest).max(group);

        self.cost += entry.cost;
        self.blocks += blocks;
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    /// Split into per-adapter batches, in order of first appearance.
    pub fn finish(self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .groups
            .into_iter()
            .map(|adapter_id| Batch {
                adapter_id,
                entries: Vec::new(),
            })
            .collect();
        for entry in self.entries {
            if let Some(batch) = batches
                .iter_mut()
                .find(|b| b.adapter_id.as_deref() == entry.adapter())
            {
                batch.entries.push(entry);
            }
        }
        batches.retain(|b| !b.is_empty());
        batches
    }
}
