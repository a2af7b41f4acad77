//! Error type shared by the offline store, queue and flusher.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// No signed-in session, so no cache key can be derived.
    #[error("Encryption unavailable: no active session")]
    EncryptionUnavailable,

    /// Stored blob was sealed under a different key, or is corrupt.
    #[error("Decryption failed: cached data does not match the current session key")]
    DecryptionFailed,

    /// The backend could not be reached.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The backend answered but declined the operation.
    #[error("Backend rejected request (HTTP {status}): {message}")]
    BackendRejected { status: u16, message: String },

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Errors that mean "try again once connectivity returns".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::NetworkUnavailable(_))
    }

    /// Errors that a cache reader should treat as "no usable cache".
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            SyncError::EncryptionUnavailable | SyncError::DecryptionFailed
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}
