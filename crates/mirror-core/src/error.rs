//! # Core Error Types
//!
//! Errors raised by the pure cache layer. Every variant is a programming
//! or data error; nothing here is retryable.

use thiserror::Error;

use crate::store::ParseAs;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the store, parsers and record helpers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A cache name was written with a shape other than the one it holds.
    ///
    /// ## When This Occurs
    /// - `set_array` on a cache previously filled with `set_object`
    /// - Two subscriptions aliasing one cache name with different `parse_as`
    #[error("Cache '{cache_name}' holds {actual} data, cannot write {expected}")]
    ShapeMismatch {
        cache_name: String,
        expected: ParseAs,
        actual: ParseAs,
    },

    /// A JSON value that should be an object was something else.
    #[error("Expected a JSON object for a record, got {0}")]
    NotAnObject(String),

    /// Wire timestamp outside the range chrono can represent.
    #[error("Invalid timestamp: {seconds}s + {nanos}ns")]
    InvalidTimestamp { seconds: i64, nanos: u32 },
}
