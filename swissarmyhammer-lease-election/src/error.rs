//! Error types for lease election

use std::io;
use std::path::PathBuf;

/// Errors reported by a [`CoordinationClient`](crate::CoordinationClient)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    /// The session with the coordination service is not usable
    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    /// Exclusive create found the node already present
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// The node (or its parent) does not exist
    #[error("Node does not exist: {path}")]
    NoNode { path: String },

    /// The node still has children and cannot be removed
    #[error("Node has children: {path}")]
    NotEmpty { path: String },

    /// Any other failure reported by the backend
    #[error("Coordination backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// True when the error means the session should be re-established
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }
}

/// Errors that can occur during lease election
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// A coordination service call failed
    #[error("Coordination failure: {0}")]
    Coordination(#[from] CoordinationError),

    /// The lease record could not be decoded
    #[error("Malformed lease record {record:?}: {reason}")]
    MalformedLeaseRecord { record: String, reason: String },

    /// The lock node is held by another instance
    #[error("Lock node is held by another instance: {path}")]
    LockContended { path: String },

    /// A newer instance registered for the same role
    #[error("Instance preempted: local version {local} is behind remote version {remote}")]
    Preempted { local: i64, remote: i64 },

    /// `start()` was called while the loops are already running
    #[error("Leader elector is already running")]
    AlreadyRunning,

    /// Reading or writing the local version cache failed
    #[error("Version cache file {path}: {source}")]
    CacheFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration is not usable
    #[error("Invalid election configuration: {message}")]
    InvalidConfig { message: String },

    /// Loading the configuration failed
    #[error("Failed to load election configuration: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl ElectionError {
    /// Build a [`ElectionError::MalformedLeaseRecord`]
    pub fn malformed(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedLeaseRecord {
            record: record.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`ElectionError::InvalidConfig`]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ElectionError {
    fn from(error: figment::Error) -> Self {
        Self::Config(Box::new(error))
    }
}

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;
