//! Common error types for TokenMux
//!
//! This module defines all error types used across the TokenMux system.
//! The variants mirror the failure taxonomy of the orchestration layer:
//! resource and lock errors are surfaced synchronously to the caller and
//! never left to corrupt shared state.

use thiserror::Error;

/// Main error type for TokenMux
#[derive(Error, Debug)]
pub enum TokenMuxError {
    /// Model name unconfigured, session id absent, checkpoint missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate session id on create
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation already in flight for the same session id
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Model instance cap reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Checkpoint context-size mismatch
    #[error("Incompatible checkpoint: {0}")]
    Incompatible(String),

    /// Checkpoint fails to parse or is missing artifacts
    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),

    /// Null/out-of-range state or config
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller or linked token cancelled mid-operation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Inference engine failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TokenMuxError {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        TokenMuxError::NotFound(msg.into())
    }

    /// Create an already-exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        TokenMuxError::AlreadyExists(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        TokenMuxError::Conflict(msg.into())
    }

    /// Create a resource-exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        TokenMuxError::ResourceExhausted(msg.into())
    }

    /// Create an incompatible-checkpoint error
    pub fn incompatible(msg: impl Into<String>) -> Self {
        TokenMuxError::Incompatible(msg.into())
    }

    /// Create a corrupt-checkpoint error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        TokenMuxError::Corrupt(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        TokenMuxError::InvalidArgument(msg.into())
    }

    /// Create a cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        TokenMuxError::Cancelled(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        TokenMuxError::Engine(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TokenMuxError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        TokenMuxError::Internal(msg.into())
    }

    /// Whether this error denotes a cancelled operation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TokenMuxError::Cancelled(_))
    }
}

/// Result type alias for TokenMux operations
pub type Result<T> = std::result::Result<T, TokenMuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(
            TokenMuxError::conflict("infer already running"),
            TokenMuxError::Conflict(_)
        ));
        assert!(matches!(
            TokenMuxError::not_found("model llama-7b"),
            TokenMuxError::NotFound(_)
        ));
    }

    #[test]
    fn test_cancelled_predicate() {
        assert!(TokenMuxError::cancelled("caller token").is_cancelled());
        assert!(!TokenMuxError::conflict("busy").is_cancelled());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TokenMuxError = io.into();
        assert!(matches!(err, TokenMuxError::Io(_)));
    }
}
