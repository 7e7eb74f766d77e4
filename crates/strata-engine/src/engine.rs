//! The per-server storage engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use strata_erasure::ErasureLayout;
use strata_index::{IndexDb, IndexDbConfig, IndexError, TempFile};
use strata_ring::Ring;
use strata_types::{
    CONTENT_LENGTH, Device, IndexItem, Metadata, Method, NURSERY_SHARD, ObjectHash,
    PriorityRepJob, X_TIMESTAMP, format_timestamp,
};
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::StabilizeCache;
use crate::erasure::ErasureCodedObject;
use crate::error::EngineError;
use crate::object::{Object, ObjectCore, ObjectKey, ObjectVars, request_timestamp};
use crate::peer::PeerClient;
use crate::replicated::{REPLICATED_SHARD, ReplicatedObject};
use crate::stream::items_missing_remotely;

type Result<T> = std::result::Result<T, EngineError>;

/// How a policy lays objects out across its primaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Identical full copies on every primary.
    Replicated,
    /// `k + m` Reed-Solomon shards, one per primary.
    ErasureCoded {
        layout: ErasureLayout,
        /// Primaries that receive full nursery copies.
        nursery_replicas: usize,
    },
}

/// Configuration for a [`StorageEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one subdirectory per mounted device.
    pub devices_root: PathBuf,
    /// Storage policy index.
    pub policy: u32,
    pub hash_path_prefix: String,
    pub hash_path_suffix: String,
    pub strategy: Strategy,
    /// Tombstones older than this are purged before each stabilize pass.
    pub reclaim_age: Duration,
    /// Nursery rows younger than this are left for the next pass.
    pub min_stabilize_age: Duration,
    /// Dedup cache capacity; 0 disables it.
    pub cache_entries: usize,
    pub cache_max_age: Duration,
    /// Remove a stable handoff copy without re-checking the quorum.
    pub handoff_trusts_ring: bool,
    /// Capacity of object streams.
    pub channel_capacity: usize,
    /// This server's `(ip, port)` in the ring. Needed to tell apart devices
    /// with the same name on different servers.
    pub local_address: Option<(String, u16)>,
}

impl EngineConfig {
    pub fn new(devices_root: impl Into<PathBuf>) -> Self {
        Self {
            devices_root: devices_root.into(),
            policy: 0,
            hash_path_prefix: String::new(),
            hash_path_suffix: String::new(),
            strategy: Strategy::Replicated,
            reclaim_age: Duration::from_secs(7 * 24 * 3600),
            min_stabilize_age: Duration::ZERO,
            cache_entries: 100_000,
            cache_max_age: Duration::from_secs(600),
            handoff_trusts_ring: true,
            channel_capacity: 100,
            local_address: None,
        }
    }
}

/// Counts from one stabilize or replicate pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Outcome of a "stabilized elsewhere" notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NurseryNotice {
    /// The matching nursery copy was removed.
    Removed,
    /// This version was already known to be stable.
    Skipped,
    /// No matching nursery copy.
    NotFound,
}

/// One stable shard read back for a peer.
#[derive(Debug, Clone)]
pub struct ShardRead {
    pub metadata: Metadata,
    pub timestamp: i64,
    pub data: Bytes,
}

/// One stable shard version located on disk, not yet read.
#[derive(Debug, Clone)]
pub struct ShardFile {
    pub metadata: Metadata,
    pub timestamp: i64,
    pub path: PathBuf,
    pub length: u64,
}

/// A copy being received from a peer. Bytes go to [`ShardWrite::data`];
/// dropping it without [`ShardWrite::commit`] discards them.
pub struct ShardWrite {
    core: ObjectCore,
    shard: u16,
    nursery: bool,
}

impl ShardWrite {
    /// Writer for the incoming bytes.
    pub fn data(&mut self) -> Result<&mut TempFile> {
        self.core.temp_mut()
    }

    /// Index the received bytes under `metadata`.
    pub fn commit(mut self, metadata: Metadata) -> Result<()> {
        self.core
            .commit(self.shard, Method::Put, metadata, self.nursery, false)
    }
}

type DeviceCell = Arc<OnceCell<Arc<IndexDb>>>;

/// State shared by the engine and every object it hands out.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) ring: Arc<dyn Ring>,
    pub(crate) peers: Arc<dyn PeerClient>,
    pub(crate) cache: StabilizeCache,
    devices: RwLock<HashMap<String, DeviceCell>>,
}

impl Shared {
    /// Whether a ring node is the named local device.
    pub(crate) fn is_local_device(&self, node: &Device, device: &str) -> bool {
        node.device == device
            && self
                .config
                .local_address
                .as_ref()
                .is_none_or(|(ip, port)| node.ip == *ip && node.port == *port)
    }

    /// Fetch or create the open-once cell of a device. The map lock is
    /// only held for the lookup.
    fn device_cell(&self, device: &str) -> DeviceCell {
        if let Some(cell) = self
            .devices
            .read()
            .expect("device registry lock poisoned")
            .get(device)
        {
            return cell.clone();
        }
        self.devices
            .write()
            .expect("device registry lock poisoned")
            .entry(device.to_string())
            .or_default()
            .clone()
    }
}

/// Dual-tier object storage for the devices of one server.
///
/// Cheap to clone; clones share device handles and the dedup cache.
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<Shared>,
}

impl StorageEngine {
    pub fn new(
        config: EngineConfig,
        ring: Arc<dyn Ring>,
        peers: Arc<dyn PeerClient>,
    ) -> Result<Self> {
        if let Strategy::ErasureCoded {
            layout,
            nursery_replicas,
        } = &config.strategy
        {
            if layout.total_shards() != ring.replica_count() {
                return Err(EngineError::Validation(format!(
                    "{}+{} shards need a ring with {} replicas, got {}",
                    layout.data_shards,
                    layout.parity_shards,
                    layout.total_shards(),
                    ring.replica_count()
                )));
            }
            if *nursery_replicas == 0 || *nursery_replicas > layout.total_shards() {
                return Err(EngineError::Validation(format!(
                    "nursery replicas must be in 1..={}, got {nursery_replicas}",
                    layout.total_shards()
                )));
            }
        }

        let cache = StabilizeCache::new(config.cache_entries, config.cache_max_age);
        Ok(Self {
            inner: Arc::new(Shared {
                config,
                ring,
                peers,
                cache,
                devices: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn ring(&self) -> &Arc<dyn Ring> {
        &self.inner.ring
    }

    pub fn cache(&self) -> &StabilizeCache {
        &self.inner.cache
    }

    /// Hash of an object path under this cluster's salt.
    pub fn hash_path(&self, account: &str, container: &str, object: &str) -> ObjectHash {
        ObjectHash::from_path(
            &self.inner.config.hash_path_prefix,
            &self.inner.config.hash_path_suffix,
            account,
            container,
            object,
        )
    }

    /// Shard slot nursery copies are written to.
    pub fn nursery_shard(&self) -> u16 {
        match self.inner.config.strategy {
            Strategy::Replicated => REPLICATED_SHARD,
            Strategy::ErasureCoded { .. } => NURSERY_SHARD,
        }
    }

    /// Ring devices served by this engine's devices root, as far as the
    /// configured local address tells.
    pub fn local_devices(&self) -> Vec<Device> {
        match &self.inner.config.local_address {
            Some((ip, port)) => self.inner.ring.local_devices(ip, *port),
            None => self
                .inner
                .ring
                .devices()
                .into_iter()
                .filter(|d| self.inner.config.devices_root.join(&d.device).is_dir())
                .collect(),
        }
    }

    // ----- Devices -----

    /// Index of a local device, opened on first use.
    pub async fn get_db(&self, device: &str) -> Result<Arc<IndexDb>> {
        let cell = self.inner.device_cell(device);
        let db = cell.get_or_try_init(|| self.open_db(device)).await?;
        Ok(db.clone())
    }

    async fn open_db(&self, device: &str) -> Result<Arc<IndexDb>> {
        if device.is_empty() || device.contains('/') || device == "." || device == ".." {
            return Err(EngineError::UnknownDevice(device.to_string()));
        }
        let root = self.inner.config.devices_root.join(device);
        let mounted = tokio::fs::metadata(&root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !mounted {
            return Err(EngineError::UnknownDevice(device.to_string()));
        }

        let policy = self.inner.config.policy;
        let config = IndexDbConfig {
            part_power: self.inner.ring.part_power(),
            reclaim_age: self.inner.config.reclaim_age,
            min_stabilize_age: self.inner.config.min_stabilize_age,
        };
        let db = tokio::task::spawn_blocking(move || IndexDb::open(root, policy, config))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;
        info!(device, policy, "opened device index");
        Ok(Arc::new(db))
    }

    // ----- Objects -----

    fn resolve_hash(&self, key: &ObjectKey) -> ObjectHash {
        match key {
            ObjectKey::Hash(hash) => *hash,
            ObjectKey::Path {
                account,
                container,
                object,
            } => self.hash_path(account, container, object),
        }
    }

    fn lookup(&self, idb: &IndexDb, hash: &ObjectHash) -> Result<Option<IndexItem>> {
        Ok(match self.inner.config.strategy {
            Strategy::Replicated => idb.lookup(hash, REPLICATED_SHARD, true)?,
            Strategy::ErasureCoded { .. } => idb.lookup_any(hash, true)?,
        })
    }

    fn build_object(
        &self,
        idb: Arc<IndexDb>,
        device: &str,
        hash: ObjectHash,
        item: Option<IndexItem>,
    ) -> Result<Box<dyn Object>> {
        let core = ObjectCore::new(self.inner.clone(), idb, device.to_string(), hash, item)?;
        Ok(match &self.inner.config.strategy {
            Strategy::Replicated => Box::new(ReplicatedObject::new(core)),
            Strategy::ErasureCoded {
                layout,
                nursery_replicas,
            } => Box::new(ErasureCodedObject::new(core, *layout, *nursery_replicas)),
        })
    }

    /// Check a live row against its data file.
    async fn verify(&self, item: &IndexItem, need_data: bool) -> std::result::Result<(), String> {
        if item.deletion {
            return Ok(());
        }
        let metadata = item
            .metadata()
            .map_err(|e| format!("unparsable metadata: {e}"))?;
        let content_length: u64 = metadata
            .get(CONTENT_LENGTH)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                format!(
                    "unable to parse content length {:?}",
                    metadata.get(CONTENT_LENGTH)
                )
            })?;
        let path = item.path.as_ref().ok_or("row has no data file")?;
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("data file {}: {e}", path.display()))?
            .len();
        let expected = match &self.inner.config.strategy {
            Strategy::ErasureCoded { layout, .. } if !item.nursery => {
                layout.shard_length(content_length)
            }
            _ => content_length,
        };
        if size != expected {
            return Err(format!("file size {size} does not match expected {expected}"));
        }
        if need_data {
            tokio::fs::File::open(path)
                .await
                .map_err(|e| format!("data file {}: {e}", path.display()))?;
        }
        Ok(())
    }

    /// Open an object on a local device.
    ///
    /// A row that fails the integrity check is quarantined and reported as
    /// [`EngineError::Integrity`]. The data file size is checked on every
    /// open; `need_data` also requires the file to be readable.
    pub async fn new_object(&self, vars: &ObjectVars, need_data: bool) -> Result<Box<dyn Object>> {
        let idb = self.get_db(&vars.device).await?;
        let hash = self.resolve_hash(&vars.key);
        let item = self.lookup(&idb, &hash)?;

        if let Some(item) = &item
            && let Err(reason) = self.verify(item, need_data).await
        {
            warn!(device = %vars.device, %hash, %reason, "integrity check failed");
            idb.quarantine(item)?;
            return Err(EngineError::Integrity(reason));
        }

        self.build_object(idb, &vars.device, hash, item)
    }

    /// Rebuild this device's shard of an erasure-coded object.
    pub async fn reconstruct(&self, vars: &ObjectVars) -> Result<()> {
        let mut object = self.new_object(vars, false).await?;
        object.reconstruct().await
    }

    // ----- Streams -----

    /// Stream the local rows of `job.partition` that `job.to_device` lacks.
    ///
    /// The stream ends when `tx` is dropped, which happens on every return
    /// path. A failed remote listing ends the stream early.
    pub async fn get_objects_to_replicate(
        &self,
        job: PriorityRepJob,
        tx: mpsc::Sender<Box<dyn Object>>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.produce_replicate(&job, &tx, &cancel).await {
            warn!(
                partition = job.partition,
                from = %job.from_device.device,
                to = %job.to_device.device,
                error = %e,
                "replication listing failed"
            );
        }
    }

    async fn produce_replicate(
        &self,
        job: &PriorityRepJob,
        tx: &mpsc::Sender<Box<dyn Object>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let device = &job.from_device.device;
        let idb = self.get_db(device).await?;
        let local = idb.list_partition(job.partition)?;
        let remote = self
            .inner
            .peers
            .list_partition(&job.to_device, job.partition)
            .await?;

        for item in items_missing_remotely(&local, &remote) {
            let object = match self.build_object(idb.clone(), device, item.hash, Some(item.clone())) {
                Ok(object) => object,
                Err(e) => {
                    warn!(hash = %item.hash, error = %e, "skipping unreadable row");
                    continue;
                }
            };
            if !send_or_cancel(tx, object, cancel).await {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Stream the rows of a device that need stabilizing, in random order.
    ///
    /// Expired tombstones are purged first. Cancel the token to stop the
    /// producer early.
    pub fn get_objects_to_stabilize(
        &self,
        device: &Device,
    ) -> (mpsc::Receiver<Box<dyn Object>>, CancellationToken) {
        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let engine = self.clone();
        let name = device.device.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.produce_stabilize(&name, tx, token).await {
                warn!(device = %name, error = %e, "stabilize listing failed");
            }
        });
        (rx, cancel)
    }

    async fn produce_stabilize(
        &self,
        device: &str,
        tx: mpsc::Sender<Box<dyn Object>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let idb = self.get_db(device).await?;
        idb.expire_objects()?;
        let mut items = idb.list_objects_to_stabilize()?;
        self.inner.cache.mark_being_stabilized(
            device,
            items.iter().map(|i| (&i.hash, i.metahash.as_str())),
        );
        items.shuffle(&mut rand::rng());
        debug!(device, count = items.len(), "objects to stabilize");

        for item in items {
            let hash = item.hash;
            let object = match self.build_object(idb.clone(), device, hash, Some(item)) {
                Ok(object) => object,
                Err(e) => {
                    warn!(%hash, error = %e, "skipping unreadable row");
                    continue;
                }
            };
            if !send_or_cancel(&tx, object, &cancel).await {
                break;
            }
        }
        Ok(())
    }

    /// Run one stabilize pass over a local device.
    #[tracing::instrument(skip(self, device), fields(device = %device.device))]
    pub async fn stabilize_device(&self, device: &Device) -> PassReport {
        let (mut rx, cancel) = self.get_objects_to_stabilize(device);
        let _guard = cancel.drop_guard();

        let mut report = PassReport::default();
        while let Some(mut object) = rx.recv().await {
            report.processed += 1;
            match object.stabilize(device).await {
                Ok(()) => report.succeeded += 1,
                Err(e) if e.is_retryable() => {
                    debug!(object = %object.repr(), error = %e, "stabilize deferred");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(object = %object.repr(), error = %e, "stabilize failed");
                    report.failed += 1;
                }
            }
            object.close();
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                "stabilize pass complete"
            );
        }
        report
    }

    /// Copy everything `job.to_device` lacks of one partition.
    #[tracing::instrument(skip(self, job), fields(partition = job.partition, from = %job.from_device.device, to = %job.to_device.device))]
    pub async fn replicate_partition(&self, job: &PriorityRepJob) -> PassReport {
        let (tx, mut rx) = mpsc::channel(self.inner.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let engine = self.clone();
        let producer_job = job.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            engine
                .get_objects_to_replicate(producer_job, tx, token)
                .await;
        });
        let _guard = cancel.drop_guard();

        let mut report = PassReport::default();
        while let Some(mut object) = rx.recv().await {
            report.processed += 1;
            match object.replicate(job).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(object = %object.repr(), error = %e, "replication failed");
                    report.failed += 1;
                }
            }
            object.close();
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            "partition replication complete"
        );
        report
    }

    // ----- Peer-facing operations -----

    /// Install a stable copy or shard sent by a peer.
    pub async fn stable_put(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        metadata: Metadata,
        body: Bytes,
    ) -> Result<()> {
        let mut write = self.stable_writer(device, hash, shard, body.len() as u64).await?;
        std::io::Write::write_all(write.data()?, &body)?;
        write.commit(metadata)
    }

    /// Start receiving a stable copy or shard of about `size` bytes.
    pub async fn stable_writer(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        size: u64,
    ) -> Result<ShardWrite> {
        self.writer(device, hash, shard, size, false).await
    }

    /// Start receiving a nursery copy pushed by a proxy.
    pub async fn nursery_writer(
        &self,
        device: &str,
        hash: ObjectHash,
        size: u64,
    ) -> Result<ShardWrite> {
        self.writer(device, hash, self.nursery_shard(), size, true)
            .await
    }

    async fn writer(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        size: u64,
        nursery: bool,
    ) -> Result<ShardWrite> {
        let idb = self.get_db(device).await?;
        let mut core = ObjectCore::new(self.inner.clone(), idb, device.to_string(), hash, None)?;
        core.set_data(shard, size)?;
        Ok(ShardWrite {
            core,
            shard,
            nursery,
        })
    }

    /// Replace the metadata of a stored row, keeping its tier.
    pub async fn stable_post(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        metadata: Metadata,
    ) -> Result<()> {
        let idb = self.get_db(device).await?;
        let item = idb
            .lookup(&hash, shard, false)?
            .ok_or(EngineError::NotFound)?;
        let nursery = item.nursery;
        let mut core =
            ObjectCore::new(self.inner.clone(), idb, device.to_string(), hash, Some(item))?;
        core.commit(shard, Method::Post, metadata, nursery, false)
    }

    /// Remove a row older than `timestamp`. Same or newer rows conflict.
    pub async fn stable_delete(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        timestamp: i64,
    ) -> Result<()> {
        let idb = self.get_db(device).await?;
        let item = idb
            .lookup(&hash, shard, true)?
            .ok_or(EngineError::NotFound)?;
        if timestamp <= item.timestamp {
            return Err(IndexError::Conflict {
                hash,
                shard,
                stored: item.timestamp,
                incoming: timestamp,
            }
            .into());
        }
        idb.remove(
            &item.hash,
            item.shard,
            item.timestamp,
            item.nursery,
            &item.metahash,
        )?;
        debug!(device, %hash, shard, "removed stable row");
        Ok(())
    }

    /// Read a stable shard, the current version or an explicit one.
    pub async fn read_shard(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        timestamp: Option<i64>,
    ) -> Result<ShardRead> {
        let file = self.shard_file(device, hash, shard, timestamp).await?;
        let data = match tokio::fs::read(&file.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ShardRead {
            metadata: file.metadata,
            timestamp: file.timestamp,
            data: data.into(),
        })
    }

    /// Locate a stable shard, the current version or an explicit one,
    /// without reading it.
    pub async fn shard_file(
        &self,
        device: &str,
        hash: ObjectHash,
        shard: u16,
        timestamp: Option<i64>,
    ) -> Result<ShardFile> {
        let idb = self.get_db(device).await?;
        let current = idb.lookup(&hash, shard, false)?;

        let (path, timestamp, metadata) = match (timestamp, current) {
            (None, None) => return Err(EngineError::NotFound),
            (None, Some(item)) => {
                let path = item.path.clone().ok_or(EngineError::NotFound)?;
                (path, item.timestamp, item.metadata()?)
            }
            (Some(ts), current) => {
                let metadata = match current {
                    Some(item) if item.timestamp == ts => item.metadata()?,
                    _ => Metadata::from([(X_TIMESTAMP.to_string(), format_timestamp(ts))]),
                };
                (idb.whole_object_path(&hash, shard, ts, false), ts, metadata)
            }
        };

        let length = match tokio::fs::metadata(&path).await {
            Ok(stat) => stat.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ShardFile {
            metadata,
            timestamp,
            path,
            length,
        })
    }

    /// Every row of a partition on a local device, in key order.
    pub async fn list_partition(&self, device: &str, partition: u64) -> Result<Vec<IndexItem>> {
        let idb = self.get_db(device).await?;
        Ok(idb.list_partition(partition)?)
    }

    /// Write a nursery copy or tombstone pushed by a proxy.
    pub async fn nursery_put(
        &self,
        device: &str,
        hash: ObjectHash,
        deletion: bool,
        metadata: Metadata,
        body: Bytes,
    ) -> Result<()> {
        request_timestamp(&metadata)?;
        if !deletion {
            let mut write = self.nursery_writer(device, hash, body.len() as u64).await?;
            std::io::Write::write_all(write.data()?, &body)?;
            return write.commit(metadata);
        }
        let idb = self.get_db(device).await?;
        let mut core = ObjectCore::new(self.inner.clone(), idb, device.to_string(), hash, None)?;
        core.commit(self.nursery_shard(), Method::Delete, metadata, true, false)
    }

    /// Another server stabilized this version: drop the local nursery copy.
    pub async fn nursery_stabilized_elsewhere(
        &self,
        device: &str,
        hash: ObjectHash,
        metahash: &str,
        timestamp: i64,
    ) -> Result<NurseryNotice> {
        if metahash.is_empty() {
            return Err(EngineError::Validation("empty metahash".into()));
        }
        let idb = self.get_db(device).await?;
        let cache = &self.inner.cache;
        if !cache.update_item_stabilized(device, &hash, metahash, true) {
            return Ok(NurseryNotice::Skipped);
        }
        match idb.remove(&hash, self.nursery_shard(), timestamp, true, metahash) {
            Ok(0) => Ok(NurseryNotice::NotFound),
            Ok(_) => Ok(NurseryNotice::Removed),
            Err(e) => {
                cache.update_item_stabilized(device, &hash, metahash, false);
                Err(e.into())
            }
        }
    }
}

/// Send unless cancelled. Returns `false` when the stream should stop.
async fn send_or_cancel(
    tx: &mpsc::Sender<Box<dyn Object>>,
    object: Box<dyn Object>,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(object) => sent.is_ok(),
    }
}
