//! Shared types and identifiers for Strata.
//!
//! This crate defines the core types used across the Strata workspace:
//! the content address of an object ([`ObjectHash`]), ring devices
//! ([`Device`]), index rows ([`IndexItem`]), commit methods ([`Method`]),
//! replication jobs ([`PriorityRepJob`]), and the helpers shared by every
//! layer for timestamps, metadata hashing and header names.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod timestamp;

pub use timestamp::{format_timestamp, now_nanos, parse_timestamp};

/// Object metadata: header-style keys to string values.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key holding the authoritative version of an object.
pub const X_TIMESTAMP: &str = "X-Timestamp";

/// Metadata key holding the size of the whole object in bytes.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Metadata key holding the MD5 of the whole object.
pub const ETAG: &str = "ETag";

/// Metadata key holding the object's `/account/container/object` name.
pub const NAME: &str = "name";

/// Header prefix used to carry metadata between peers.
pub const META_PREFIX: &str = "Meta-";

/// Shard slot used by erasure-coded nursery copies.
///
/// Stable shards use their coding index; the nursery copy of the full
/// object gets its own slot so both can coexist on one device.
pub const NURSERY_SHARD: u16 = u16::MAX;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from parsing shared types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypesError {
    /// The string is not 32 hex characters.
    #[error("invalid object hash: {0:?}")]
    InvalidHash(String),

    /// The string is not a decimal timestamp.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
}

// ---------------------------------------------------------------------------
// ObjectHash
// ---------------------------------------------------------------------------

/// Content address of an object: MD5 of its salted `/account/container/object` path.
///
/// Byte order equals hex-string order, so the index can range-scan hashes
/// per ring partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default)]
pub struct ObjectHash([u8; 16]);

impl ObjectHash {
    /// The smallest hash.
    pub const MIN: ObjectHash = ObjectHash([0; 16]);

    /// Hash an object path with the cluster's hash-path prefix and suffix.
    pub fn from_path(
        prefix: &str,
        suffix: &str,
        account: &str,
        container: &str,
        object: &str,
    ) -> Self {
        let mut hasher = Md5::new();
        hasher.update(prefix.as_bytes());
        hasher.update(format!("/{account}/{container}/{object}").as_bytes());
        hasher.update(suffix.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Parse a 32-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, TypesError> {
        let invalid = || TypesError::InvalidHash(hex.to_string());
        if hex.len() != 32 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = hex_nibble(hex.as_bytes()[i * 2]).ok_or_else(invalid)?;
            let lo = hex_nibble(hex.as_bytes()[i * 2 + 1]).ok_or_else(invalid)?;
            *byte = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    /// Return the raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Build a hash from the top 128 bits of a number.
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// Interpret the hash as a big-endian number.
    pub fn to_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    /// Ring partition owning this hash: its top `part_power` bits.
    pub fn partition(&self, part_power: u32) -> u64 {
        if part_power == 0 {
            return 0;
        }
        let mut top = [0u8; 8];
        top.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(top) >> (64 - part_power.min(64))
    }
}

impl From<[u8; 16]> for ObjectHash {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({self})")
    }
}

impl FromStr for ObjectHash {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Ring devices
// ---------------------------------------------------------------------------

/// A storage device as listed in the ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Ring-unique device id.
    pub id: u32,
    /// Failure domain: region.
    #[serde(default)]
    pub region: u32,
    /// Failure domain: zone within the region.
    #[serde(default)]
    pub zone: u32,
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Address of the server holding the device.
    pub ip: String,
    /// Port of the server holding the device.
    pub port: u16,
    /// Address used for peer-to-peer traffic (defaults to `ip`).
    #[serde(default)]
    pub replication_ip: String,
    /// Port used for peer-to-peer traffic (defaults to `port`).
    #[serde(default)]
    pub replication_port: u16,
    /// Mount name under the devices root (e.g. `sdb1`).
    pub device: String,
    /// Relative share of partitions.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_weight() -> f64 {
    1.0
}

impl Device {
    /// Base URL for peer-to-peer requests to this device's server.
    pub fn replication_url(&self) -> String {
        let ip = if self.replication_ip.is_empty() {
            &self.ip
        } else {
            &self.replication_ip
        };
        let port = if self.replication_port == 0 {
            self.port
        } else {
            self.replication_port
        };
        format!("{}://{}:{}", self.scheme, ip, port)
    }

    /// Whether `other` names the same physical device (ip, port, mount).
    pub fn same_location(&self, other: &Device) -> bool {
        self.ip == other.ip && self.port == other.port && self.device == other.device
    }
}

// ---------------------------------------------------------------------------
// Index rows
// ---------------------------------------------------------------------------

/// One row of a device's index database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexItem {
    /// Content address of the object.
    pub hash: ObjectHash,
    /// 0 for replicated objects, the coding index for erasure-coded shards,
    /// [`NURSERY_SHARD`] for erasure-coded nursery copies.
    pub shard: u16,
    /// Authoritative version, nanoseconds since the epoch.
    pub timestamp: i64,
    /// Whether the row is in the nursery tier.
    pub nursery: bool,
    /// Whether the row is a tombstone.
    pub deletion: bool,
    /// Digest of `metabytes`.
    pub metahash: String,
    /// JSON-encoded [`Metadata`].
    pub metabytes: Vec<u8>,
    /// Data file location; `None` for tombstones.
    pub path: Option<PathBuf>,
    /// Peers must re-verify this row's metadata.
    pub restabilize: bool,
}

impl IndexItem {
    /// Decode the row's metadata.
    pub fn metadata(&self) -> Result<Metadata, serde_json::Error> {
        serde_json::from_slice(&self.metabytes)
    }
}

/// How a commit changes a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Install new data.
    Put,
    /// Install a tombstone.
    Delete,
    /// Replace metadata, keep data.
    Post,
}

impl Method {
    /// HTTP verb for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest identifying one version of an object's metadata.
pub fn metahash(metabytes: &[u8]) -> String {
    let digest: [u8; 16] = Md5::digest(metabytes).into();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonical form of a header name: `x-object-meta-color` → `X-Object-Meta-Color`.
pub fn canonical_header_key(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Map a `Meta-*` header suffix back to its metadata key.
///
/// `Name` and `Etag` have non-canonical spellings in metadata.
pub fn metadata_key_from_header(suffix: &str) -> String {
    match canonical_header_key(suffix).as_str() {
        "Name" => NAME.to_string(),
        "Etag" => ETAG.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Replication jobs
// ---------------------------------------------------------------------------

/// A request to copy one partition from one device to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityRepJob {
    /// Ring partition to copy.
    pub partition: u64,
    /// Device currently holding the data.
    pub from_device: Device,
    /// Device that should receive it.
    pub to_device: Device,
    /// Storage policy index.
    pub policy: u32,
}
