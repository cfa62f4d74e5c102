//! Request-level failure taxonomy.
//!
//! Every completion handle resolves with either a result or one of these.

use thiserror::Error;

use crate::adapters::AdapterError;
use crate::inference::EngineError;
use crate::kv_cache::AllocatorError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServeError {
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("adapter {0} was evicted or removed between admission and dispatch")]
    CacheRace(String),

    #[error("request waited {waited_ms}ms in queue, admission deadline is {deadline_ms}ms")]
    AdmissionTimeout { waited_ms: u64, deadline_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled before dispatch")]
    Cancelled,

    #[error("service is shutting down")]
    ShuttingDown,
}

impl ServeError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServeError::CapacityExceeded(_)
                | ServeError::Engine(_)
                | ServeError::CacheRace(_)
                | ServeError::AdmissionTimeout { .. }
                | ServeError::ShuttingDown
        )
    }

    /// Short label used for metrics and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::AdapterNotFound(_) => "adapter_not_found",
            ServeError::CapacityExceeded(_) => "capacity_exceeded",
            ServeError::Engine(_) => "engine_error",
            ServeError::CacheRace(_) => "cache_race",
            ServeError::AdmissionTimeout { .. } => "admission_timeout",
            ServeError::InvalidRequest(_) => "invalid_request",
            ServeError::Cancelled => "cancelled",
            ServeError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<AllocatorError> for ServeError {
    fn from(err: AllocatorError) -> Self {
        ServeError::CapacityExceeded(err.to_string())
    }
}

impl From<AdapterError> for ServeError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::NotFound { adapter_id, .. } | AdapterError::InvalidId(adapter_id) => {
                ServeError::AdapterNotFound(adapter_id)
            }
            pinned @ AdapterError::AllPinned { .. } => {
                ServeError::CapacityExceeded(pinned.to_string())
            }
            AdapterError::Load { source, .. } => ServeError::Engine(source),
        }
    }
}

pub type ServeResult<T> = Result<T, ServeError>;
