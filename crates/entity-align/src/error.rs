//! Error type for the alignment training core.
//!
//! # Design Principles
//!
//! - **NO FALLBACKS**: errors propagate, they are never silently handled
//! - **FAIL FAST**: invalid configuration or shapes error immediately
//! - **CONTEXTUAL**: every variant carries the data needed to debug it
//!
//! Empty batches are deliberately *not* an error anywhere in this
//! crate: every batch-dependent term degrades to a neutral value so the
//! training loop can skip a step cheaply.

use thiserror::Error;

/// Error type for all alignment-core failures.
#[derive(Debug, Error)]
pub enum AlignError {
    /// A feature was enabled without the inputs it requires, or a
    /// config value is out of range. Fatal, surfaced at construction
    /// or load time, never retried.
    #[error("configuration error: {message}")]
    ConfigError { message: String },

    /// An embedding table's row count does not cover the entity-id
    /// range referenced by the batch.
    #[error("shape mismatch in {context}: expected at least {expected} rows, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A batch referenced an entity id outside the replay cache's
    /// allocated size. The cache is sized once at construction and
    /// never resized.
    #[error("entity id {entity} out of range (capacity {capacity})")]
    IndexOutOfRange { entity: u32, capacity: usize },

    /// Tensor backend (Candle) operation failed.
    #[error("tensor backend error: {message}")]
    Backend { message: String },

    /// Config file could not be read.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed as TOML.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result alias used throughout the crate.
pub type AlignResult<T> = Result<T, AlignError>;

/// Map Candle errors into the crate error type.
pub(crate) fn map_candle(e: candle_core::Error) -> AlignError {
    AlignError::Backend {
        message: e.to_string(),
    }
}
