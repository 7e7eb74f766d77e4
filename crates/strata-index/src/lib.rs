//! Per-device object index for Strata.
//!
//! Every local device owns one [`IndexDb`]: a Fjall keyspace of
//! [`IndexItem`](strata_types::IndexItem) rows keyed by
//! `hash ++ shard (big-endian u16)`, plus the object files those rows point
//! at. Because keys sort like hashes, a ring partition is one contiguous
//! range ([`IndexDb::ring_part_range`]).
//!
//! On-disk layout under a device root:
//!
//! ```text
//! {root}/objects-{policy}/index/                          Fjall database
//! {root}/objects-{policy}/data/{h[0..2]}/{h[2..4]}/{h}.{shard}.{ts}.{n|s}
//! {root}/tmp/                                             uncommitted writes
//! {root}/quarantined/objects-{policy}/                    corrupt files
//! ```

mod db;
mod error;
mod layout;
mod temp;

pub use db::{CommitRequest, HashRange, IndexDb, IndexDbConfig};
pub use error::IndexError;
pub use layout::DeviceLayout;
pub use temp::TempFile;
