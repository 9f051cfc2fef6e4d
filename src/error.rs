//! Error handling for boardlink
//!
//! This module defines the crate-wide error type and a Result alias used
//! by every layer, from layout construction up to session snapshots.

use crate::layout::LayoutError;
use thiserror::Error;

/// Main error type for boardlink operations
#[derive(Error, Debug)]
pub enum BoardError {
    /// Invalid layout geometry
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Slice arguments outside the descriptor's frame
    #[error("Index error: offset {offset} + length {length} exceeds frame of {available} bytes")]
    Index {
        offset: i32,
        length: i32,
        available: usize,
    },

    /// The compiler has no rule for this (descriptor kind, operator) pair
    #[error("Unsupported derivation: {kind} cannot feed a {operator} processor")]
    UnsupportedDerivation {
        kind: &'static str,
        operator: String,
    },

    /// No board reply matched the request within its budget
    #[error("Timeout: no response for {key} within {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    /// The byte channel refused a frame
    #[error("Transport error: {0}")]
    Transport(String),

    /// A deferred result was dropped before it resolved
    #[error("Channel error: {0}")]
    Channel(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Board reply did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Name or id not present in the processor table
    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    /// Recorder used in the wrong state
    #[error("Recorder error: {0}")]
    Recorder(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BoardError>,
    },
}

impl BoardError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BoardError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping any context wrappers
    pub fn root(&self) -> &BoardError {
        match self {
            BoardError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error (or the one it wraps) is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), BoardError::Timeout { .. })
    }
}

/// Result type alias for boardlink operations
pub type Result<T> = std::result::Result<T, BoardError>;

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
