//! Error types for celldex operations.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CelldexError>;

/// Errors reported by index construction, subarray configuration, and query
/// execution.
///
/// Configuration problems (`InvalidArgument`, `OutOfDomain`, `Empty`) are
/// raised when the offending call is made, never during `submit`. Runtime
/// failures (`BufferTooSmall`, `Io`, `Cancelled`) terminate the query; the
/// index itself never retries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CelldexError {
    /// A malformed argument: inverted range, zero dimensions, fanout below 2,
    /// unknown attribute, datatype mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An R-tree build was attempted with no leaf MBRs.
    #[error("cannot build R-tree; no leaf MBRs supplied")]
    Empty,

    /// A range lies wholly outside the dimension domain.
    #[error("range out of domain: {0}")]
    OutOfDomain(String),

    /// A result buffer cannot hold even a single cell.
    #[error("buffer too small: {0}")]
    BufferTooSmall(String),

    /// The underlying tile fetch failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// The query was cancelled by the caller.
    #[error("query cancelled")]
    Cancelled,

    /// An internal invariant was violated; should never escape in normal
    /// operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CelldexError {
    /// Shorthand used at argument-validation sites.
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CelldexError::InvalidArgument(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        CelldexError::Internal(msg.into())
    }
}
