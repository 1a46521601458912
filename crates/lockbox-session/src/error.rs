//! Error types

/// Session errors
///
/// Expected outcomes such as a wrong password or a denied biometric prompt
/// are returned as values; these variants are faults.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] lockbox_storage_sqlite::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credential file is unreadable or inconsistent
    #[error("Credential error: {0}")]
    Credential(String),

    /// Persisted session record is corrupted
    #[error("Vault error: {0}")]
    Vault(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Blocking task failed to complete
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
