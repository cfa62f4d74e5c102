//! HTTP server exposing the serving core.
//!
//! - [`api`]: request/response types and route handlers
//! - [`streaming`]: SSE streaming for chunk-by-chunk responses
//! - [`shutdown`]: OS signal future for graceful shutdown

pub mod api;
pub mod shutdown;
pub mod streaming;
