//! Request admission and batch dispatch.
//!
//! - [`request`]: queue entries and single-assignment completion handles
//! - [`queue`]: per-tenant FIFOs with weighted round-robin service
//! - [`policy`]: token-budget / wait-window batch formation
//! - [`batcher`]: the dispatch loop driving adapters, KV reservations and the engine

pub mod batcher;
pub mod policy;
pub mod queue;
pub mod request;

pub use batcher::{BatchScheduler, ENDPOINT_GENERATE, ENDPOINT_STREAM};
pub use policy::{estimate_cost, Batch, BatchBuilder, BatchPolicy, CloseReason};
pub use queue::{Lookahead, TenantQueues};
pub use request::{Completer, Completion, CompletionHandle, QueueEntry};
