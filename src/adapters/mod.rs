//! LoRA adapter residency.
//!
//! - [`cache`]: bounded, reference-counted, LRU-evicted adapter cache

pub mod cache;

pub use cache::{AdapterCache, AdapterError, AdapterHandle, AdapterLease, AdapterStats};
