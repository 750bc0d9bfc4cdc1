//! Error types for the swarmgate runtime

use std::fmt;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur across the cluster runtime
#[derive(Debug, Clone)]
pub enum Error {
    /// Configuration errors (bad file, bad env override, invalid trust proxy)
    Config(String),
    /// Invalid input surfaced to the caller; never retried
    Validation(String),
    /// Operation exceeded its deadline
    Timeout(String),
    /// Retryable failure (IPC send, spawn, probe); converted to Degraded when exhausted
    Transient(String),
    /// Memory/CPU/FD/queue limit hit; triggers pressure handlers
    Resource(String),
    /// Signature or auth-tag mismatch, disallowed registration; never retried
    Security(String),
    /// Plugin reported or threw an error
    Plugin(String),
    /// Serialization / deserialization failure on a wire boundary
    Serialization(String),
    /// Underlying I/O failure
    Io(String),
    /// Invariant breakage inside the runtime
    Internal(String),
    /// Unrecoverable: bind failure, corrupted state; stops the orchestrator
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::Transient(msg) => write!(f, "Transient error: {}", msg),
            Error::Resource(msg) => write!(f, "Resource error: {}", msg),
            Error::Security(msg) => write!(f, "Security error: {}", msg),
            Error::Plugin(msg) => write!(f, "Plugin error: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether a retry policy may re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transient(_) | Error::Io(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<crate::crypto::CryptoError> for Error {
    fn from(err: crate::crypto::CryptoError) -> Self {
        Error::Security(err.to_string())
    }
}
