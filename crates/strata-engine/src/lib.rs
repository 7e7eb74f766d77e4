//! Dual-tier storage engine for Strata object servers.
//!
//! New writes land in the nursery tier of a device's [`IndexDb`]. The
//! stabilizer later promotes them to the stable tier once the ring's
//! primaries agree: replicated policies wait for every primary to hold the
//! same version, erasure-coded policies encode the nursery copy into
//! shards and place one on each primary.
//!
//! The [`StorageEngine`] owns one index per local device, hands out
//! [`Object`]s whose strategy is fixed at construction, and produces the
//! object streams consumed by the stabilizer and by partition replication.
//! Peers are reached through the [`PeerClient`] trait.
//!
//! [`IndexDb`]: strata_index::IndexDb

pub mod cache;
pub mod engine;
pub mod erasure;
pub mod error;
pub mod object;
pub mod peer;
pub mod replicated;
pub mod stream;

pub use cache::StabilizeCache;
pub use engine::{
    EngineConfig, NurseryNotice, PassReport, ShardFile, ShardRead, ShardWrite, StorageEngine,
    Strategy,
};
pub use erasure::ErasureCodedObject;
pub use error::{EngineError, ErrorClass};
pub use object::{Object, ObjectKey, ObjectVars};
pub use peer::{
    DELETION_HEADER, HttpPeerClient, POLICY_HEADER, PeerClient, PeerError,
    SHARD_TIMESTAMP_HEADER, encode_name, meta_headers, metadata_from_headers,
};
pub use replicated::ReplicatedObject;
pub use stream::items_missing_remotely;
