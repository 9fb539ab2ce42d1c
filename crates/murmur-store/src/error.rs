use murmur_shared::DeliveryStatus;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// A record with the same key already exists.
    #[error("Record already exists")]
    AlreadyExists,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Delivery status may only move forward.
    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// A JSON column failed to encode or decode.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Another thread panicked while holding the database lock.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// The blocking worker running a query was cancelled or panicked.
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Map "no rows" to [`StoreError::NotFound`].
pub(crate) fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}
