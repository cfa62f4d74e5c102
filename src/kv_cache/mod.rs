//! KV cache block accounting.
//!
//! - [`allocator`]: block-granular reservation map bounding in-flight memory

pub mod allocator;

pub use allocator::{AllocatorError, BlockAllocator, KvStats, ReservationGuard, SharedAllocator};
