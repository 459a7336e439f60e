//! Error types for bamline operations.
//!
//! The taxonomy mirrors how errors behave at runtime: I/O faults abort the
//! current component, format errors are fatal to the enclosing stream, index
//! errors are non-fatal for sequential scans, and internal errors indicate a
//! broken invariant.

use std::io;

use thiserror::Error;

/// Result type alias for bamline operations
pub type Result<T> = std::result::Result<T, BamlineError>;

/// Error type for bamline operations
#[derive(Error, Debug)]
pub enum BamlineError {
    /// A read/write/seek/open fault on a device or temp file.
    #[error("{op}: {source}")]
    Io {
        /// The operation that failed, e.g. `"BamReader::open"`
        op: String,
        /// The underlying OS error
        #[source]
        source: io::Error,
    },

    /// Malformed record length, CIGAR code, truncated payload or bad header.
    #[error("format error: {reason}")]
    Format {
        /// Explanation of the problem
        reason: String,
    },

    /// Missing or corrupt index, or a region out of range.
    #[error("index error: {reason}")]
    Index {
        /// Explanation of the problem
        reason: String,
    },

    /// Invalid configuration or CLI combination.
    #[error("usage error: {reason}")]
    Usage {
        /// Explanation of the problem
        reason: String,
    },

    /// Invariant violation inside the engine.
    #[error("internal error: {reason}")]
    Internal {
        /// Diagnostic message
        reason: String,
    },
}

impl BamlineError {
    /// Wrap an I/O error with the name of the failing operation.
    pub fn io(op: impl Into<String>, source: io::Error) -> Self {
        Self::Io { op: op.into(), source }
    }

    /// Build a format error from a reason string.
    pub fn format(reason: impl Into<String>) -> Self {
        Self::Format { reason: reason.into() }
    }

    /// Build an index error from a reason string.
    pub fn index(reason: impl Into<String>) -> Self {
        Self::Index { reason: reason.into() }
    }

    /// Build a usage error from a reason string.
    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage { reason: reason.into() }
    }

    /// Build an internal error from a reason string.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal { reason: reason.into() }
    }
}
