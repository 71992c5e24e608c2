//! Error handling for telemcache
//!
//! This module defines the crate-wide error type and a Result alias. Errors are
//! `Clone` so that the outcome of a single in-flight channel resolution can be
//! handed to every caller waiting on it.

use crate::types::{ChannelKey, DataType};
use thiserror::Error;

/// Main error type for cache and stream operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A channel key was requested that was never populated or could not be resolved
    #[error("Channel not found: {0}")]
    NotFound(ChannelKey),

    /// The retrieval or stream collaborator failed. Safe to retry.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A write would have produced overlapping or out-of-order segments
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A segment's data type does not match its channel
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    DataTypeMismatch { expected: DataType, actual: DataType },

    /// Device buffer allocation or upload failed
    #[error("Device error: {0}")]
    Device(String),

    /// The operation was cancelled by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// The cache manager or multiplexer has been closed
    #[error("Closed")]
    Closed,

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CacheError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers stripped
    pub fn root(&self) -> &CacheError {
        match self {
            CacheError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), CacheError::Transport(_))
    }

    /// Whether the error poisons the channel cache it came from
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), CacheError::InvariantViolation(_))
    }
}

/// Result type alias for telemcache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
