//! The object capability shared by both storage strategies.

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use strata_index::{CommitRequest, IndexDb, TempFile};
use strata_types::{
    CONTENT_LENGTH, Device, IndexItem, Metadata, Method, ObjectHash, PriorityRepJob, X_TIMESTAMP,
    format_timestamp, parse_timestamp,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::engine::Shared;
use crate::error::EngineError;
use crate::peer::{PeerError, is_success};

type Result<T> = std::result::Result<T, EngineError>;

/// How a request names an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKey {
    /// A precomputed hash, as used by peer-to-peer calls.
    Hash(ObjectHash),
    /// A client path, hashed with the cluster's hash-path salt.
    Path {
        account: String,
        container: String,
        object: String,
    },
}

/// Which object on which device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVars {
    pub device: String,
    pub key: ObjectKey,
}

impl ObjectVars {
    pub fn hash(device: impl Into<String>, hash: ObjectHash) -> Self {
        Self {
            device: device.into(),
            key: ObjectKey::Hash(hash),
        }
    }

    pub fn path(
        device: impl Into<String>,
        account: impl Into<String>,
        container: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            key: ObjectKey::Path {
                account: account.into(),
                container: container.into(),
                object: object.into(),
            },
        }
    }
}

/// One object on one device, in either tier.
///
/// Obtained from [`StorageEngine::new_object`](crate::StorageEngine::new_object).
/// Mutations require `X-Timestamp` in the supplied metadata.
#[async_trait]
pub trait Object: Send + Sync {
    /// Whether a live (non-tombstone) version exists.
    fn exists(&self) -> bool;

    fn metadata(&self) -> &Metadata;

    /// Size of the whole object in bytes.
    fn content_length(&self) -> u64;

    /// Short description for logs.
    fn repr(&self) -> String;

    /// The index row backing this object, if any.
    fn item(&self) -> Option<&IndexItem>;

    /// Write the whole object to `w`.
    async fn copy(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64>;

    /// Write bytes `start..end` of the object to `w`.
    async fn copy_range(
        &self,
        w: &mut (dyn AsyncWrite + Unpin + Send),
        start: u64,
        end: u64,
    ) -> Result<u64>;

    /// Open a writer for `size` bytes of new data, abandoning any previous one.
    fn set_data(&mut self, size: u64) -> Result<&mut TempFile>;

    /// Install the data written through [`Object::set_data`] as a nursery PUT.
    async fn commit(&mut self, metadata: Metadata) -> Result<()>;

    /// Install a nursery tombstone.
    async fn delete(&mut self, metadata: Metadata) -> Result<()>;

    /// Update metadata, keeping the data and tier.
    async fn commit_metadata(&mut self, metadata: Metadata) -> Result<()>;

    /// Move the data file aside and drop the row.
    async fn quarantine(&mut self) -> Result<()>;

    /// Send this object to `job.to_device`.
    async fn replicate(&mut self, job: &PriorityRepJob) -> Result<()>;

    /// Run one stabilization step on behalf of the local `device`.
    async fn stabilize(&mut self, device: &Device) -> Result<()>;

    /// Rebuild this device's shard from surviving peers.
    async fn reconstruct(&mut self) -> Result<()> {
        Err(EngineError::Unsupported("reconstruct"))
    }

    /// Release the object, abandoning uncommitted data.
    fn close(self: Box<Self>) {}
}

/// Parse the mandatory `X-Timestamp` of a mutation.
pub(crate) fn request_timestamp(metadata: &Metadata) -> Result<i64> {
    let raw = metadata
        .get(X_TIMESTAMP)
        .ok_or_else(|| EngineError::Validation("no timestamp in metadata".into()))?;
    parse_timestamp(raw).map_err(|e| EngineError::Validation(e.to_string()))
}

/// Whether a ring node is the local device.
pub(crate) fn is_local(node: &Device, local: &Device) -> bool {
    node.same_location(local)
}

/// Turn a rejected status into an error.
pub(crate) fn check_status(node: &Device, status: u16, accept: fn(u16) -> bool) -> Result<()> {
    if accept(status) {
        Ok(())
    } else {
        Err(PeerError::Status {
            url: node.replication_url(),
            status,
        }
        .into())
    }
}

/// 2xx or 409.
pub(crate) fn write_accepted(status: u16) -> bool {
    is_success(status) || status == 409
}

/// 2xx, 404 or 409.
pub(crate) fn delete_accepted(status: u16) -> bool {
    write_accepted(status) || status == 404
}

/// Run one peer call per node concurrently and count the accepted answers.
pub(crate) async fn fan_out<F, Fut>(nodes: Vec<Device>, call: F, accept: fn(u16) -> bool) -> usize
where
    F: Fn(Device) -> Fut,
    Fut: Future<Output = std::result::Result<u16, PeerError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for node in nodes {
        set.spawn(call(node));
    }

    let mut accepted = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(status)) if accept(status) => accepted += 1,
            Ok(Ok(status)) => debug!(status, "peer rejected request"),
            Ok(Err(e)) => warn!(error = %e, "peer request failed"),
            Err(e) => warn!(error = %e, "peer task failed"),
        }
    }
    accepted
}

/// Stream part of a file into `w`.
pub(crate) async fn copy_file(
    path: &Path,
    w: &mut (dyn AsyncWrite + Unpin + Send),
    start: u64,
    len: Option<u64>,
) -> Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let written = match len {
        Some(len) => tokio::io::copy(&mut file.take(len), w).await?,
        None => tokio::io::copy(&mut file, w).await?,
    };
    w.flush().await?;
    Ok(written)
}

/// State shared by both object strategies.
pub(crate) struct ObjectCore {
    pub(crate) shared: Arc<Shared>,
    pub(crate) idb: Arc<IndexDb>,
    pub(crate) device: String,
    pub(crate) hash: ObjectHash,
    pub(crate) item: Option<IndexItem>,
    pub(crate) metadata: Metadata,
    temp: Option<TempFile>,
}

impl ObjectCore {
    pub(crate) fn new(
        shared: Arc<Shared>,
        idb: Arc<IndexDb>,
        device: String,
        hash: ObjectHash,
        item: Option<IndexItem>,
    ) -> Result<Self> {
        let metadata = match &item {
            Some(item) => item.metadata()?,
            None => Metadata::new(),
        };
        Ok(Self {
            shared,
            idb,
            device,
            hash,
            item,
            metadata,
            temp: None,
        })
    }

    pub(crate) fn exists(&self) -> bool {
        self.item.as_ref().is_some_and(|i| !i.deletion)
    }

    pub(crate) fn content_length(&self) -> u64 {
        self.metadata
            .get(CONTENT_LENGTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// The stored version as an `X-Timestamp` string.
    pub(crate) fn timestamp_header(&self) -> String {
        match self.metadata.get(X_TIMESTAMP) {
            Some(ts) => ts.clone(),
            None => format_timestamp(self.item.as_ref().map_or(0, |i| i.timestamp)),
        }
    }

    pub(crate) fn repr(&self, kind: &str) -> String {
        match &self.item {
            Some(item) => format!(
                "{kind}<{}/{}/{} ts={} nursery={}>",
                self.device, self.hash, item.shard, item.timestamp, item.nursery
            ),
            None => format!("{kind}<{}/{} missing>", self.device, self.hash),
        }
    }

    /// Ring partition and primaries of this object.
    pub(crate) fn placement(&self) -> (u64, Vec<Device>) {
        let partition = self.shared.ring.partition_for(&self.hash);
        (partition, self.shared.ring.nodes_for(partition))
    }

    pub(crate) fn set_data(&mut self, shard: u16, size: u64) -> Result<&mut TempFile> {
        let temp = self.idb.temp_file(&self.hash, shard, size)?;
        Ok(self.temp.insert(temp))
    }

    pub(crate) fn temp_mut(&mut self) -> Result<&mut TempFile> {
        self.temp
            .as_mut()
            .ok_or_else(|| EngineError::Validation("no data being written".into()))
    }

    /// Commit one mutation of `(hash, shard)` and reload the row.
    pub(crate) fn commit(
        &mut self,
        shard: u16,
        method: Method,
        metadata: Metadata,
        nursery: bool,
        restabilize: bool,
    ) -> Result<()> {
        let timestamp = request_timestamp(&metadata)?;
        let temp = match method {
            Method::Put => Some(
                self.temp
                    .take()
                    .ok_or_else(|| EngineError::Validation("commit without data".into()))?,
            ),
            Method::Delete | Method::Post => None,
        };
        self.idb.commit(CommitRequest {
            temp,
            hash: self.hash,
            shard,
            timestamp,
            method,
            metadata,
            nursery,
            restabilize,
        })?;
        self.reload(shard)
    }

    pub(crate) fn reload(&mut self, shard: u16) -> Result<()> {
        self.item = self.idb.lookup(&self.hash, shard, true)?;
        self.metadata = match &self.item {
            Some(item) => item.metadata()?,
            None => Metadata::new(),
        };
        Ok(())
    }

    /// Drop the loaded row if it is still the stored version.
    pub(crate) fn remove_item(&self) -> Result<usize> {
        match &self.item {
            Some(item) => Ok(self.idb.remove(
                &item.hash,
                item.shard,
                item.timestamp,
                item.nursery,
                &item.metahash,
            )?),
            None => Ok(0),
        }
    }

    pub(crate) fn quarantine(&mut self) -> Result<()> {
        if let Some(item) = self.item.take() {
            self.idb.quarantine(&item)?;
        }
        self.metadata.clear();
        Ok(())
    }

    pub(crate) fn data_path(&self) -> Result<&Path> {
        self.item
            .as_ref()
            .and_then(|i| i.path.as_deref())
            .ok_or(EngineError::NotFound)
    }

    /// Read the local data file.
    pub(crate) async fn read_data(&self) -> Result<bytes::Bytes> {
        let path = self.data_path()?;
        Ok(tokio::fs::read(path).await?.into())
    }
}
