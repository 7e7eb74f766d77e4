//! Error types for priority replication.

use strata_engine::PeerError;

/// Errors from planning and dispatching replication jobs.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// The source server could not be reached.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// The source server refused or failed the job.
    #[error("priority replication of partition {partition} from {device} returned {status}")]
    Rejected {
        partition: u64,
        device: String,
        status: u16,
    },

    /// Part-move planning needs rings with the same partition count.
    #[error("part power changed from {old} to {new}")]
    PartPowerMismatch { old: u32, new: u32 },
}
