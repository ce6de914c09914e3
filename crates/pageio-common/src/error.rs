//! Error types for PageIO
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for PageIO operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Common error type for PageIO
#[derive(Debug, Error)]
pub enum CacheError {
    /// An allocator (entry record, coalesce buffer, or physical page) is
    /// exhausted
    #[error("out of memory")]
    OutOfMemory,

    /// A virtual address could not be torn down because a reference or
    /// dirty state was observed
    #[error("resource in use")]
    ResourceInUse,

    /// A write to the backing store completed short
    #[error("short write: expected {expected} bytes, completed {completed}")]
    ShortWrite { expected: u64, completed: u64 },

    /// The underlying device reported a failure
    #[error("device error: {0}")]
    Device(String),

    /// Internal control signal: give up the current pass and retry after
    /// eviction has run
    #[error("try again")]
    TryAgain,

    /// A versioned structure was supplied with an unsupported version
    #[error("unsupported version: given {given}, required {required}")]
    UnsupportedVersion { given: u32, required: u32 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Whether the failed operation left retryable state behind (the pages
    /// involved were re-marked dirty and a later pass will pick them up)
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TryAgain | Self::ShortWrite { .. } | Self::Device(_) | Self::Io(_)
        )
    }
}
