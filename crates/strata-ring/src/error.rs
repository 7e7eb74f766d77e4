//! Error types for the ring crate.

/// Errors from loading, validating or building a ring.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Filesystem error reading or writing a ring file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The ring file is not valid JSON for a ring.
    #[error("ring file format error: {0}")]
    Json(#[from] serde_json::Error),

    /// Partition power outside the supported range.
    #[error("invalid partition power {0} (must be at most 32)")]
    InvalidPartPower(u32),

    /// The assignment table does not have one row per partition.
    #[error("expected {expected} partitions, found {got}")]
    PartitionCount { expected: u64, got: usize },

    /// A partition does not list exactly `replicas` devices.
    #[error("partition {partition} has {got} devices, expected {expected}")]
    ReplicaCount {
        partition: u64,
        expected: usize,
        got: usize,
    },

    /// A partition references a device id not in the device list.
    #[error("partition {partition} references unknown device {device_id}")]
    UnknownDevice { partition: u64, device_id: u32 },

    /// A partition lists the same device twice.
    #[error("partition {partition} lists device {device_id} more than once")]
    DuplicateAssignment { partition: u64, device_id: u32 },

    /// Two devices share an id.
    #[error("duplicate device id {0}")]
    DuplicateDevice(u32),

    /// Fewer devices than replicas.
    #[error("need at least {needed} devices, have {available}")]
    NotEnoughDevices { needed: usize, available: usize },
}
