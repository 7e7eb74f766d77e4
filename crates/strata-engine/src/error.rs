//! Error types for the storage engine.

use strata_index::IndexError;

use crate::peer::PeerError;

/// How callers should treat an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request; fail it, never retry.
    Validation,
    /// Stale timestamp or row already gone; a benign no-op.
    Conflict,
    /// The object does not exist.
    NotFound,
    /// On-disk state disagrees with the index.
    Integrity,
    /// A peer was unreachable or answered non-2xx; retry next pass.
    TransientPeer,
    /// The index database is unavailable.
    Database,
}

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Index database error.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Erasure coding error.
    #[error("erasure error: {0}")]
    Erasure(#[from] strata_erasure::ErasureError),

    /// Peer request failed.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// Data file I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored metadata could not be decoded.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Malformed request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Data file missing or the wrong size. The object has been quarantined.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// No such object.
    #[error("object not found")]
    NotFound,

    /// The device is not mounted under the devices root.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// Quorum not reached this pass.
    #[error("could not stabilize: {0}")]
    NotStabilized(String),

    /// The operation does not exist for this storage strategy.
    #[error("{0} is not supported by this storage policy")]
    Unsupported(&'static str),
}

impl EngineError {
    /// Map the error into the engine's error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Index(e) => match e {
                IndexError::Conflict { .. } => ErrorClass::Conflict,
                IndexError::NotFound { .. } => ErrorClass::NotFound,
                IndexError::Validation(_) => ErrorClass::Validation,
                IndexError::Io(_) | IndexError::Json(_) => ErrorClass::Integrity,
                IndexError::Fjall(_) | IndexError::Serde(_) => ErrorClass::Database,
            },
            Self::Erasure(strata_erasure::ErasureError::NotEnoughShards { .. }) => {
                ErrorClass::TransientPeer
            }
            Self::Erasure(_) => ErrorClass::Integrity,
            Self::Peer(_) | Self::NotStabilized(_) => ErrorClass::TransientPeer,
            Self::Io(_) | Self::Metadata(_) | Self::Integrity(_) => ErrorClass::Integrity,
            Self::Validation(_) | Self::Unsupported(_) => ErrorClass::Validation,
            Self::NotFound => ErrorClass::NotFound,
            Self::UnknownDevice(_) => ErrorClass::Database,
        }
    }

    /// Whether the next pass may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientPeer
    }

    /// Whether this is a stale-timestamp conflict.
    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}
