//! Error Module - Heap Inspection Error Types
//!
//! Every failure the engine can report falls into one of four classes.
//!
//! # Error Categories
//!
//! ## Target Errors
//! - `DataRead` - a required remote read or metadata query failed
//! - `HeapCorruption` - a read succeeded but decoded to an invalid value
//!
//! ## Control Errors
//! - `UserInterrupt` - cooperative cancellation was requested
//! - `ResourceExhaustion` - a cache or result could not grow
//!
//! ## Session Errors
//! - `Configuration` - invalid [`SessionConfig`](crate::SessionConfig)
//! - `SnapshotFormat` / `Io` - a target snapshot could not be loaded
//!
//! # Propagation
//!
//! `DataRead` and `HeapCorruption` are fatal while topology is being
//! established. During per-object iteration or per-node expansion they are
//! local: the object or branch is abandoned and the caller continues.
//! `UserInterrupt` always aborts the whole query.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all heap inspection operations
///
/// # Examples
///
/// ```rust
/// use heapscope::HeapError;
///
/// fn describe(err: &HeapError) -> &'static str {
///     match err {
///         HeapError::DataRead { .. } => "target memory unavailable",
///         HeapError::HeapCorruption { .. } => "heap looks corrupted",
///         HeapError::UserInterrupt => "interrupted",
///         _ => "other",
///     }
/// }
///
/// assert_eq!(describe(&HeapError::UserInterrupt), "interrupted");
/// ```
#[derive(Debug, Error)]
pub enum HeapError {
    /// A remote read or structured metadata query failed
    ///
    /// **When returned:** The reader reports unmapped memory, or the metadata
    /// service cannot answer for a heap, segment or type
    ///
    /// **Recovery strategy:** Fatal during topology build; otherwise abandon
    /// the current object or branch and attach a diagnostic
    #[error("Failed to read {what} at {address:#x}")]
    DataRead { address: u64, what: String },

    /// Structurally invalid heap data
    ///
    /// **When returned:** A type handle resolves to no layout, an object
    /// overruns its segment, a segment chain loops, and similar
    ///
    /// **Recovery strategy:** Careful walks resume at the next segment
    #[error("Heap corruption at {address:#x}: {reason}")]
    HeapCorruption { address: u64, reason: String },

    /// Cooperative cancellation observed
    ///
    /// **When returned:** The session's cancellation token was set while an
    /// object walk or graph query was running
    ///
    /// **Recovery strategy:** None; partial results are discarded
    #[error("Operation interrupted by user")]
    UserInterrupt,

    /// Allocation failure or configured cap exceeded
    ///
    /// **When returned:** A GCDesc buffer, search arena or result set could
    /// not be reserved
    ///
    /// **Recovery strategy:** Report and stop that sub-operation
    #[error("Resource exhausted: {resource}")]
    ResourceExhaustion { resource: String },

    /// Invalid session configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Snapshot JSON could not be parsed or produced
    #[error("Snapshot format error: {0}")]
    SnapshotFormat(#[from] serde_json::Error),

    /// Snapshot file could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeapError {
    /// Read failure of `length` bytes at `address`
    pub fn read(address: u64, length: usize) -> Self {
        HeapError::DataRead {
            address,
            what: format!("{} bytes", length),
        }
    }

    /// Failed metadata query identified by `what`
    pub fn query(address: u64, what: impl Into<String>) -> Self {
        HeapError::DataRead {
            address,
            what: what.into(),
        }
    }

    pub fn corruption(address: u64, reason: impl Into<String>) -> Self {
        HeapError::HeapCorruption {
            address,
            reason: reason.into(),
        }
    }

    pub fn exhausted(resource: impl Into<String>) -> Self {
        HeapError::ResourceExhaustion {
            resource: resource.into(),
        }
    }

    /// Errors after which an object walk cannot find its next position
    ///
    /// Everything else is confined to the current segment.
    pub fn ends_walk(&self) -> bool {
        matches!(
            self,
            HeapError::DataRead { .. } | HeapError::UserInterrupt
        )
    }

    /// Errors confined to one object or one graph branch
    ///
    /// The enclosing walk or query records a diagnostic and continues.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            HeapError::DataRead { .. } | HeapError::HeapCorruption { .. }
        )
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, HeapError::UserInterrupt)
    }
}

/// Result type for heap inspection operations
pub type Result<T> = std::result::Result<T, HeapError>;
