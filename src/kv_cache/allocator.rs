//! Block allocator for in-flight KV cache capacity.
//!
//! Capacity is a fixed pool of `capacity_blocks` blocks of `block_tokens`
//! tokens each. Every reservation is recorded against its request id, and the
//! used-block counter only ever moves together with that map, so the counter is
//! always the sum of the recorded reservations.
//!
//! Releasing an id that holds no reservation is an explicit
//! [`AllocatorError::UnknownReservation`] and leaves the accounting untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("KV capacity exceeded: requested {requested} blocks, {available} of {capacity} free")]
    CapacityExceeded {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("request {0} already holds a reservation")]
    AlreadyReserved(String),

    #[error("no reservation recorded for request {0}")]
    UnknownReservation(String),
}

/// A single request's hold on the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    blocks: usize,
    tokens: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    /// Request id -> reservation.
    reservations: HashMap<String, Reservation>,

    /// Sum of `blocks` over `reservations`.
    used_blocks: usize,

    /// Sum of `tokens` over `reservations`.
    stored_tokens: usize,
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KvStats {
    pub capacity_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub active_reservations: usize,
    pub stored_tokens: usize,
    /// `1 - stored_tokens / (used_blocks * block_tokens)`, 0 when nothing is reserved.
    pub fragmentation_ratio: f64,
}

/// Block-granular reservation map.
#[derive(Debug)]
pub struct BlockAllocator {
    block_tokens: usize,
    capacity_blocks: usize,
    ledger: Mutex<Ledger>,
}

/// Thread-safe handle to the allocator.
pub type SharedAllocator = Arc<BlockAllocator>;

impl BlockAllocator {
    /// Create an allocator with `capacity_blocks` blocks of `block_tokens` tokens.
    pub fn new(block_tokens: usize, capacity_blocks: usize) -> Self {
        Self {
            block_tokens: block_tokens.max(1),
            capacity_blocks,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks needed to hold `token_count` tokens.
    pub fn blocks_for(&self, token_count: usize) -> usize {
        token_count.div_ceil(self.block_tokens)
    }

    /// Reserve capacity for `request_id`. Returns the number of blocks reserved.
    ///
    /// Refuses rather than oversubscribes: on refusal nothing is recorded.
    pub fn reserve(&self, request_id: &str, token_count: usize) -> Result<usize, AllocatorError> {
        let needed = self.blocks_for(token_count);
        let mut ledger = self.ledger();

        if ledger.reservations.contains_key(request_id) {
            return Err(AllocatorError::AlreadyReserved(request_id.to_string()));
        }

        let available = self.capacity_blocks - ledger.used_blocks;
        if needed > available {
            debug!(
                request_id,
                needed,
                available,
                "KV reservation refused"
            );
            return Err(AllocatorError::CapacityExceeded {
                requested: needed,
                available,
                capacity: self.capacity_blocks,
            });
        }

        ledger.reservations.insert(
            request_id.to_string(),
            Reservation {
                blocks: needed,
                tokens: token_count,
            },
        );
        ledger.used_blocks += needed;
        ledger.stored_tokens += token_count;

        debug!(
            request_id,
            blocks = needed,
            used = ledger.used_blocks,
            "KV blocks reserved"
        );
        Ok(needed)
    }

    /// Reserve and return a guard that releases the reservation when dropped.
    pub fn reserve_guard(
        self: &Arc<Self>,
        request_id: &str,
        token_count: usize,
    ) -> Result<ReservationGuard, AllocatorError> {
        let blocks = self.reserve(request_id, token_count)?;
        Ok(ReservationGuard {
            allocator: Arc::clone(self),
            request_id: request_id.to_string(),
            blocks,
            released: false,
        })
    }

    /// Free exactly the blocks recorded for `request_id`. Returns the blocks freed.
    pub fn release(&self, request_id: &str) -> Result<usize, AllocatorError> {
        let mut ledger = self.ledger();
        let reservation = ledger
            .reservations
            .remove(request_id)
            .ok_or_else(|| AllocatorError::UnknownReservation(request_id.to_string()))?;

        ledger.used_blocks -= reservation.blocks;
        ledger.stored_tokens -= reservation.tokens;

        debug!(
            request_id,
            blocks = reservation.blocks,
            used = ledger.used_blocks,
            "KV blocks released"
        );
        Ok(reservation.blocks)
    }

    /// Whether `token_count` tokens could ever fit in an empty pool.
    pub fn fits_empty(&self, token_count: usize) -> bool {
        self.blocks_for(token_count) <= self.capacity_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.capacity_blocks - self.ledger().used_blocks
    }

    pub fn used_blocks(&self) -> usize {
        self.ledger().used_blocks
    }

    pub fn capacity_blocks(&self) -> usize {
        self.capacity_blocks
    }

    pub fn block_tokens(&self) -> usize {
        self.block_tokens
    }

    /// Blocks held by `request_id`, if any.
    pub fn reserved_for(&self, request_id: &str) -> Option<usize> {
        self.ledger().reservations.get(request_id).map(|r| r.blocks)
    }

    pub fn stats(&self) -> KvStats {
        let ledger = self.ledger();
        let reserved_tokens = ledger.used_blocks * self.block_tokens;
        let fragmentation_ratio = if reserved_tokens == 0 {
            0.0
        } else {
            1.0 - ledger.stored_tokens as f64 / reserved_tokens as f64
        };
        KvStats {
            capacity_blocks: self.capacity_blocks,
            used_blocks: ledger.used_blocks,
            free_blocks: self.capacity_blocks - ledger.used_blocks,
            active_reservations: ledger.reservations.len(),
            stored_tokens: ledger.stored_tokens,
            fragmentation_ratio,
        }
    }

    /// Recompute the used-block total from the reservation map.
    pub fn used_blocks_from_map(&self) -> usize {
        self.ledger().reservations.values().map(|r| r.blocks).sum()
    }
}

/// Releases its reservation exactly once: explicitly or on drop.
#[derive(Debug)]
pub struct ReservationGuard {
    allocator: SharedAllocator,
    request_id: String,
    blocks: usize,
    released: bool,
}

impl ReservationGuard {
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Release now rather than at drop.
    pub fn release(mut self) -> Result<usize, AllocatorError> {
        self.released = true;
        self.allocator.release(&self.request_id)
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.allocator.release(&self.request_id) {
            warn!(request_id = %self.request_id, "KV release on drop failed: {e}");
        }
    }
}
