//! Common error types for Weir.

use thiserror::Error;

/// Result type alias using Weir's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Weir operations.
///
/// The variants follow the orchestration failure taxonomy: configuration
/// problems and engine failures are fatal, ordering violations and
/// negotiation failures abort the offending operation but leave the
/// session alive, and external-process failures are warnings.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error (missing codec in catalog, bad tool version)
    #[error("configuration error: {0}")]
    Config(String),

    /// Media-engine failure; the engine is unusable and retry won't help
    #[error("engine error: {0}")]
    Engine(String),

    /// Caller-sequencing bug: an operation arrived before its precondition
    /// (consumer before producer, produce before connect, ...)
    #[error("ordering violation: {0}")]
    Ordering(String),

    /// No common media format between the two sides of a leg
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Signaling protocol error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// External process failure (recorder exited dirty, spawn failed)
    #[error("process error: {0}")]
    Process(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an engine error from any displayable type.
    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    /// Create an ordering-violation error from any displayable type.
    pub fn ordering(msg: impl std::fmt::Display) -> Self {
        Self::Ordering(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a process error from any displayable type.
    pub fn process(msg: impl std::fmt::Display) -> Self {
        Self::Process(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether this error indicates the whole process should terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Engine(_))
    }
}
