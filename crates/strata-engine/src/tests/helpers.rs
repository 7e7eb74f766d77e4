//! An in-process cluster: one engine per device, peers wired together
//! through a mock client that calls the target engine directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use strata_erasure::ErasureLayout;
use strata_ring::StaticRing;
use strata_types::{
    CONTENT_LENGTH, Device, IndexItem, Metadata, NAME, ObjectHash, PriorityRepJob, X_TIMESTAMP,
    format_timestamp, now_nanos, parse_timestamp,
};
use tempfile::TempDir;

use crate::engine::{EngineConfig, NurseryNotice, StorageEngine, Strategy};
use crate::error::{EngineError, ErrorClass};
use crate::object::ObjectVars;
use crate::peer::{PeerClient, PeerError};

pub const ACCOUNT: &str = "a";
pub const CONTAINER: &str = "c";

pub fn device(id: u32) -> Device {
    Device {
        id,
        region: 1,
        zone: id,
        scheme: "http".to_string(),
        ip: "127.0.0.1".to_string(),
        port: 6000 + id as u16,
        replication_ip: String::new(),
        replication_port: 0,
        device: format!("sd{id}"),
        weight: 1.0,
    }
}

/// A timestamp `secs_ago` seconds in the past, rounded to what
/// `X-Timestamp` can carry.
pub fn ts(secs_ago: i64) -> i64 {
    let raw = now_nanos() - secs_ago * 1_000_000_000;
    parse_timestamp(&format_timestamp(raw)).unwrap()
}

pub fn meta(timestamp: i64, object: &str, len: usize) -> Metadata {
    Metadata::from([
        (X_TIMESTAMP.to_string(), format_timestamp(timestamp)),
        (CONTENT_LENGTH.to_string(), len.to_string()),
        (NAME.to_string(), format!("/{ACCOUNT}/{CONTAINER}/{object}")),
    ])
}

pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Routes peer calls to the engine serving the target device.
#[derive(Default)]
pub struct MockPeers {
    engines: OnceLock<HashMap<String, StorageEngine>>,
    down: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockPeers {
    fn engine(&self, device: &Device) -> Result<&StorageEngine, PeerError> {
        if self.down.lock().unwrap().contains(&device.device) {
            return Err(PeerError::Transport {
                url: device.replication_url(),
                message: "connection refused".into(),
            });
        }
        self.engines
            .get()
            .and_then(|m| m.get(&device.device))
            .ok_or_else(|| PeerError::Transport {
                url: device.replication_url(),
                message: "no such server".into(),
            })
    }

    fn record(&self, verb: &str, device: &Device) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{verb} {}", device.device));
    }

    pub fn set_down(&self, device: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(device.to_string());
        } else {
            set.remove(device);
        }
    }

    /// Number of recorded calls with this verb.
    pub fn count(&self, verb: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

fn status_of(result: Result<(), EngineError>, ok: u16) -> u16 {
    match result {
        Ok(()) => ok,
        Err(e) => match e.class() {
            ErrorClass::Conflict => 409,
            ErrorClass::NotFound => 404,
            ErrorClass::Validation => 400,
            _ => 500,
        },
    }
}

#[async_trait]
impl PeerClient for MockPeers {
    async fn head_object(
        &self,
        device: &Device,
        _partition: u64,
        name: &str,
    ) -> Result<Option<String>, PeerError> {
        self.record("HEAD", device);
        let engine = self.engine(device)?;
        let mut parts = name.trim_start_matches('/').splitn(3, '/');
        let (Some(a), Some(c), Some(o)) = (parts.next(), parts.next(), parts.next()) else {
            return Ok(None);
        };
        match engine
            .new_object(&ObjectVars::path(&device.device, a, c, o), false)
            .await
        {
            Ok(object) if object.exists() => Ok(object.metadata().get(X_TIMESTAMP).cloned()),
            _ => Ok(None),
        }
    }

    async fn put_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
        body: Bytes,
    ) -> Result<u16, PeerError> {
        self.record("PUT", device);
        let engine = self.engine(device)?;
        let result = engine
            .stable_put(&device.device, *hash, index, metadata.clone(), body)
            .await;
        Ok(status_of(result, 201))
    }

    async fn post_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
    ) -> Result<u16, PeerError> {
        self.record("POST", device);
        let engine = self.engine(device)?;
        let result = engine
            .stable_post(&device.device, *hash, index, metadata.clone())
            .await;
        Ok(status_of(result, 202))
    }

    async fn delete_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: &str,
    ) -> Result<u16, PeerError> {
        self.record("DELETE", device);
        let engine = self.engine(device)?;
        let Ok(timestamp) = parse_timestamp(timestamp) else {
            return Ok(400);
        };
        let result = engine
            .stable_delete(&device.device, *hash, index, timestamp)
            .await;
        Ok(status_of(result, 204))
    }

    async fn get_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: Option<i64>,
    ) -> Result<Option<(Metadata, Bytes)>, PeerError> {
        self.record("GET", device);
        let engine = self.engine(device)?;
        match engine
            .read_shard(&device.device, *hash, index, timestamp)
            .await
        {
            Ok(read) => Ok(Some((read.metadata, read.data))),
            Err(EngineError::NotFound) => Ok(None),
            Err(e) => Err(PeerError::Status {
                url: device.replication_url(),
                status: status_of(Err(e), 200),
            }),
        }
    }

    async fn list_partition(
        &self,
        device: &Device,
        partition: u64,
    ) -> Result<Vec<IndexItem>, PeerError> {
        self.record("LIST", device);
        let engine = self.engine(device)?;
        engine
            .list_partition(&device.device, partition)
            .await
            .map_err(|e| PeerError::InvalidResponse {
                url: device.replication_url(),
                message: e.to_string(),
            })
    }

    async fn post_nursery(
        &self,
        device: &Device,
        hash: &ObjectHash,
        metahash: &str,
        timestamp: i64,
    ) -> Result<u16, PeerError> {
        self.record("NURSERY", device);
        let engine = self.engine(device)?;
        Ok(
            match engine
                .nursery_stabilized_elsewhere(&device.device, *hash, metahash, timestamp)
                .await
            {
                Ok(NurseryNotice::Removed) => 202,
                Ok(NurseryNotice::Skipped) => 204,
                Ok(NurseryNotice::NotFound) => 404,
                Err(e) => status_of(Err(e), 200),
            },
        )
    }

    async fn post_priority_job(
        &self,
        device: &Device,
        job: &PriorityRepJob,
    ) -> Result<u16, PeerError> {
        self.record("PRIORITY", device);
        let engine = self.engine(device)?;
        engine.replicate_partition(job).await;
        Ok(200)
    }
}

/// Four single-device servers. Partition 0 lives on sd1..sd3; sd4 is
/// a handoff.
pub struct Cluster {
    _dir: TempDir,
    pub peers: Arc<MockPeers>,
    engines: HashMap<String, StorageEngine>,
}

impl Cluster {
    pub fn replicated() -> Self {
        Self::build(3, Strategy::Replicated, |_| {})
    }

    pub fn erasure_coded(k: usize, m: usize, nursery_replicas: usize) -> Self {
        let layout = ErasureLayout::new(k, m, 64).unwrap();
        Self::build(
            k + m,
            Strategy::ErasureCoded {
                layout,
                nursery_replicas,
            },
            |_| {},
        )
    }

    pub fn build(replicas: usize, strategy: Strategy, tweak: impl Fn(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let count = replicas as u32 + 1;
        let devices: Vec<Device> = (1..=count).map(device).collect();
        let ring = Arc::new(
            StaticRing::from_assignments(0, replicas, devices.clone(), vec![
                (1..=replicas as u32).collect(),
            ])
            .unwrap(),
        );
        let peers = Arc::new(MockPeers::default());

        let mut engines = HashMap::new();
        for dev in &devices {
            let root = dir.path().join(format!("node{}", dev.id));
            std::fs::create_dir_all(root.join(&dev.device)).unwrap();
            let mut config = EngineConfig::new(root);
            config.strategy = strategy.clone();
            config.local_address = Some((dev.ip.clone(), dev.port));
            tweak(&mut config);
            let engine = StorageEngine::new(config, ring.clone(), peers.clone()).unwrap();
            engines.insert(dev.device.clone(), engine);
        }
        assert!(peers.engines.set(engines.clone()).is_ok());

        Self {
            _dir: dir,
            peers,
            engines,
        }
    }

    pub fn engine(&self, id: u32) -> &StorageEngine {
        &self.engines[&format!("sd{id}")]
    }

    pub fn hash(&self, object: &str) -> ObjectHash {
        self.engine(1).hash_path(ACCOUNT, CONTAINER, object)
    }

    /// Write a nursery copy through the object interface.
    pub async fn nursery_write(&self, id: u32, object: &str, timestamp: i64, data: &[u8]) {
        let engine = self.engine(id);
        let vars = ObjectVars::path(format!("sd{id}"), ACCOUNT, CONTAINER, object);
        let mut obj = engine.new_object(&vars, false).await.unwrap();
        std::io::Write::write_all(obj.set_data(data.len() as u64).unwrap(), data).unwrap();
        obj.commit(meta(timestamp, object, data.len())).await.unwrap();
    }

    /// Install a stable copy as a peer would.
    pub async fn stable_write(&self, id: u32, object: &str, timestamp: i64, data: &[u8]) {
        let hash = self.hash(object);
        self.engine(id)
            .stable_put(
                &format!("sd{id}"),
                hash,
                0,
                meta(timestamp, object, data.len()),
                Bytes::copy_from_slice(data),
            )
            .await
            .unwrap();
    }

    /// Row of `(hash, shard)` on a device, tombstones included.
    pub async fn row(&self, id: u32, object: &str, shard: u16) -> Option<IndexItem> {
        let db = self.engine(id).get_db(&format!("sd{id}")).await.unwrap();
        db.lookup(&self.hash(object), shard, true).unwrap()
    }
}
