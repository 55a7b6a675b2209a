//! Error types for the relational store.
//!
//! Everything that touches the SQLite database funnels its failures into
//! [`StoreError`]. Higher layers (ingestion, sessions) decide whether a given
//! failure is fatal for the current unit of work or just a warning.

use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Diesel / SQLite error.
    #[error("Database error: {0}")]
    Diesel(#[from] diesel::result::Error),

    /// The database could not be opened at startup.
    #[error("Could not connect to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: diesel::ConnectionError,
    },

    /// Embedded migrations failed to apply.
    #[error("Migration error: {0}")]
    Migration(String),

    /// `users.username` is unique.
    #[error("Username already exists: {0}")]
    DuplicateUser(String),

    /// Every generated thread id collided with an existing chat.
    #[error("Could not allocate a unique thread id after {0} attempts")]
    ThreadIdExhausted(usize),

    /// Salting or hashing a secret failed.
    #[error("Secret hashing failed: {0}")]
    Hash(String),

    /// A persisted row cannot be mapped back into a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Generic I/O error (hashing stored files, creating directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Attachment metadata could not be encoded or decoded.
    #[error("Invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn hash(msg: impl Into<String>) -> Self {
        Self::Hash(msg.into())
    }

    /// `true` when the underlying failure is a UNIQUE constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Diesel(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }
}

/// Convenience alias used throughout the store modules.
pub type Result<T> = std::result::Result<T, StoreError>;
