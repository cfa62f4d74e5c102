//! Per-tenant FIFO queues with weighted round-robin service.
//!
//! Tenants with pending work sit on a ring. The tenant at the front of the ring
//! may take up to `weight` consecutive entries before the turn moves on, so a
//! tenant with work waits at most the sum of the other active tenants' weights
//! in pops, whatever their backlog. A tenant whose queue empties leaves the
//! ring and rejoins at the tail on its next push.
//!
//! Within a tenant, entries leave in push order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::ServeError;
use crate::inference::RequestId;
use crate::scheduler::request::QueueEntry;

/// Result of a conditional pop.
#[derive(Debug)]
pub enum Lookahead<E> {
    /// The next entry passed the check and was removed.
    Taken(QueueEntry),
    /// The next entry failed the check and stays at the head of its queue.
    Declined(E),
    /// Nothing queued.
    Empty,
}

#[derive(Debug, Default)]
struct QueueState {
    tenants: HashMap<String, VecDeque<QueueEntry>>,
    /// Tenants with pending entries; front is the one being served.
    ring: VecDeque<String>,
    /// Pops left for the front tenant in its current turn.
    credit: u32,
    len: usize,
}

#[derive(Debug)]
pub struct TenantQueues {
    state: Mutex<QueueState>,
    ready: Notify,
    weights: HashMap<String, u32>,
    default_weight: u32,
}

impl Default for TenantQueues {
    fn default() -> Self {
        Self::new(HashMap::new(), 1)
    }
}

impl TenantQueues {
    pub fn new(weights: HashMap<String, u32>, default_weight: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            weights,
            default_weight: default_weight.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn weight_of(&self, tenant: &str) -> u32 {
        self.weights
            .get(tenant)
            .copied()
            .unwrap_or(self.default_weight)
            .max(1)
    }

    /// Append to the tenant's FIFO. Never blocks on the dispatcher.
    pub fn push(&self, entry: QueueEntry) {
        let tenant = entry.tenant().to_string();
        {
            let mut state = self.state();
            let queue = state.tenants.entry(tenant.clone()).or_default();
            let activated = queue.is_empty();
            queue.push_back(entry);
            state.len += 1;

            if activated {
                if state.ring.is_empty() {
                    state.credit = self.weight_of(&tenant);
                }
                state.ring.push_back(tenant.clone());
            }
            debug!(tenant = %tenant, depth = state.len, "Entry enqueued");
        }
        self.ready.notify_one();
    }

    /// Remove and return the next entry under the fairness policy.
    pub fn pop_any(&self) -> Option<QueueEntry> {
        match self.pop_if(|_| Ok::<(), ()>(())) {
            Lookahead::Taken(entry) => Some(entry),
            _ => None,
        }
    }

    /// Inspect the next entry without removing it, and remove it only if `check` passes.
    ///
    /// Entries whose caller already dropped the handle are discarded on the way.
    pub fn pop_if<E>(&self, check: impl FnOnce(&QueueEntry) -> Result<(), E>) -> Lookahead<E> {
        let mut state = self.state();
        self.discard_abandoned(&mut state);

        let Some(tenant) = state.ring.front().cloned() else {
            return Lookahead::Empty;
        };
        let Some(head) = state.tenants.get(&tenant).and_then(|q| q.front()) else {
            return Lookahead::Empty;
        };
        if let Err(reason) = check(head) {
            return Lookahead::Declined(reason);
        }

        let entry = match state.tenants.get_mut(&tenant).and_then(|q| q.pop_front()) {
            Some(entry) => entry,
            None => return Lookahead::Empty,
        };
        state.len -= 1;
        state.credit = state.credit.saturating_sub(1);
        self.advance(&mut state, &tenant);
        Lookahead::Taken(entry)
    }

    /// Move the turn on after a pop from the front tenant.
    fn advance(&self, state: &mut QueueState, tenant: &str) {
        let drained = state.tenants.get(tenant).map_or(true, |q| q.is_empty());
        if drained {
            state.tenants.remove(tenant);
            state.ring.pop_front();
        } else if state.credit == 0 {
            state.ring.rotate_left(1);
        } else {
            return;
        }
        state.credit = state
            .ring
            .front()
            .map_or(0, |next| self.weight_of(next));
    }

    fn discard_abandoned(&self, state: &mut QueueState) {
        loop {
            let Some(tenant) = state.ring.front().cloned() else {
                return;
            };
            let abandoned = state
                .tenants
                .get(&tenant)
                .and_then(|q| q.front())
                .map_or(false, |e| e.completer.is_abandoned());
            if !abandoned {
                return;
            }
            if let Some(entry) = state.tenants.get_mut(&tenant).and_then(|q| q.pop_front()) {
                debug!(request_id = %entry.request_id(), tenant = %tenant, "Discarded abandoned entry");
            }
            state.len -= 1;
            let drained = state.tenants.get(&tenant).map_or(true, |q| q.is_empty());
            if drained {
                state.tenants.remove(&tenant);
                state.ring.pop_front();
                state.credit = state
                    .ring
                    .front()
                    .map_or(0, |next| self.weight_of(next));
            }
        }
    }

    /// Remove an un-dispatched entry and resolve it as cancelled.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let removed = {
            let mut state = self.state();
            let mut found = None;
            for (tenant, queue) in state.tenants.iter_mut() {
                if let Some(pos) = queue.iter().position(|e| e.request_id() == request_id) {
                    found = queue.remove(pos).map(|entry| (tenant.clone(), entry));
                    break;
                }
            }
            let Some((tenant, entry)) = found else {
                return false;
            };
            state.len -= 1;

            if state.tenants.get(&tenant).map_or(true, |q| q.is_empty()) {
                state.tenants.remove(&tenant);
                let was_front = state.ring.front().map(String::as_str) == Some(tenant.as_str());
                state.ring.retain(|t| t != &tenant);
                if was_front {
                    state.credit = state
                        .ring
                        .front()
                        .map_or(0, |next| self.weight_of(next));
                }
            }
            entry
        };

        debug!(request_id = %request_id, "Entry cancelled before dispatch");
        removed.resolve(Err(ServeError::Cancelled));
        true
    }

    /// Remove every queued entry.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut state = self.state();
        let mut out = Vec::with_capacity(state.len);
        let ring: Vec<String> = state.ring.drain(..).collect();
        for tenant in ring {
            if let Some(queue) = state.tenants.remove(&tenant) {
                out.extend(queue);
            }
        }
        state.len = 0;
        state.credit = 0;
        out
    }

    /// Wait until a push happens. A push made before this call is not lost.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    pub fn len(&self) -> usize {
        self.state().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tenant_len(&self, tenant: &str) -> usize {
        self.state().tenants.get(tenant).map_or(0, |q| q.len())
    }

    /// Tenants with pending work, in service order.
    pub fn active_tenants(&self) -> Vec<String> {
        self.state().ring.iter().cloned().collect()
    }
}
