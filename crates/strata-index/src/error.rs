//! Error types for the index database.

use strata_types::ObjectHash;

/// Errors returned by [`IndexDb`](crate::IndexDb) operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error on object files or Fjall guards.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Row serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// Metadata encoding error.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored row is at least as new as the incoming write.
    #[error("conflict on {hash}/{shard}: stored {stored} >= incoming {incoming}")]
    Conflict {
        hash: ObjectHash,
        shard: u16,
        stored: i64,
        incoming: i64,
    },

    /// No live row for the key.
    #[error("no such object {hash}/{shard}")]
    NotFound { hash: ObjectHash, shard: u16 },

    /// The request is malformed (e.g. a PUT without data).
    #[error("invalid commit: {0}")]
    Validation(String),
}
