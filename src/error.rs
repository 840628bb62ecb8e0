//! Error types for custodian

use std::fmt;

/// Result type alias for custodian operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for custodian
#[derive(Debug)]
pub enum Error {
    /// Object store errors (coordination store)
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Topology could not be resolved or is inconsistent
    Topology(String),
    /// Repair facility errors
    Repair(String),
    /// Local backup storage errors
    Backup(String),
    /// Remote upload transport errors
    Transport(String),
    /// A held lease was taken over or expired
    LeaseLost(String),
    /// Could not acquire a cluster lock in time
    LockTimeout(String),
    /// Coordination store conflict (CAS failure)
    Conflict,
    /// Too many retries
    TooManyRetries,
    /// The job is already running on this node
    AlreadyRunning(String),
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Topology(msg) => write!(f, "Topology error: {}", msg),
            Error::Repair(msg) => write!(f, "Repair error: {}", msg),
            Error::Backup(msg) => write!(f, "Backup error: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::LeaseLost(name) => write!(f, "Lease lost: {}", name),
            Error::LockTimeout(name) => write!(f, "Timed out acquiring lock: {}", name),
            Error::Conflict => write!(f, "Coordination conflict: concurrent modification detected"),
            Error::TooManyRetries => write!(f, "Too many retries: operation failed after maximum retry attempts"),
            Error::AlreadyRunning(what) => write!(f, "Already running: {}", what),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", e))
    }
}
