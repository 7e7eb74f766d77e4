//! Shared test harness for Strata integration tests.
//!
//! [`TestCluster`] runs one storage engine per device, each behind its own
//! object server router. Peer calls are real HTTP requests dispatched
//! in-process to the target's router by [`RouterPeers`], so every byte
//! crosses the same handlers a deployed server would run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use strata_engine::{
    DELETION_HEADER, EngineConfig, POLICY_HEADER, PassReport, PeerClient, PeerError,
    SHARD_TIMESTAMP_HEADER, StorageEngine, Strategy, encode_name, meta_headers,
    metadata_from_headers,
};
use strata_erasure::ErasureLayout;
use strata_http::{StrataServer, StrataServerConfig};
use strata_ring::{Ring, StaticRing};
use strata_types::{
    Device, IndexItem, Metadata, ObjectHash, PriorityRepJob, X_TIMESTAMP, format_timestamp,
    now_nanos,
};
use tempfile::TempDir;
use tower::ServiceExt;

pub const ACCOUNT: &str = "a";
pub const CONTAINER: &str = "c";

/// Device `sd{id}`, alone on the server at `127.0.0.1:{6000 + id}`.
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

/// A wire timestamp `secs_ago` seconds in the past.
pub fn ts(secs_ago: i64) -> String {
    format_timestamp(now_nanos() - secs_ago * 1_000_000_000)
}

/// Deterministic test payload.
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// =========================================================================
// Router-backed peer client
// =========================================================================

/// [`PeerClient`] that hands each request to the router of the server
/// the target device lives on.
///
/// Servers listed as down answer every call with a transport error.
pub struct RouterPeers {
    policy: u32,
    routers: OnceLock<HashMap<String, Router>>,
    down: Mutex<HashSet<u32>>,
    requests: Mutex<Vec<String>>,
}

impl RouterPeers {
    fn new(policy: u32) -> Self {
        Self {
            policy,
            routers: OnceLock::new(),
            down: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Take the server holding `device_id` off the network, or bring it back.
    pub fn set_down(&self, device_id: u32, down: bool) {
        let mut set = self.down.lock().expect("down set lock poisoned");
        if down {
            set.insert(device_id);
        } else {
            set.remove(&device_id);
        }
    }

    /// Number of requests sent so far whose `METHOD /path` starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .expect("request log lock poisoned")
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.requests
            .lock()
            .expect("request log lock poisoned")
            .clear();
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        headers: Vec<(String, String)>,
        body: Body,
    ) -> Result<Request<Body>, PeerError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(POLICY_HEADER, self.policy.to_string());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder.body(body).map_err(|e| PeerError::Transport {
            url: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn send(
        &self,
        device: &Device,
        request: Request<Body>,
    ) -> Result<(StatusCode, HeaderMap, Bytes), PeerError> {
        let url = format!("{}{}", device.replication_url(), request.uri());
        self.requests
            .lock()
            .expect("request log lock poisoned")
            .push(format!("{} {}", request.method(), request.uri()));

        if self
            .down
            .lock()
            .expect("down set lock poisoned")
            .contains(&device.id)
        {
            return Err(PeerError::Transport {
                url,
                message: "connection refused".into(),
            });
        }
        let router = self
            .routers
            .get()
            .and_then(|routers| routers.get(&device.replication_url()))
            .cloned()
            .ok_or_else(|| PeerError::Transport {
                url: url.clone(),
                message: "no server at this address".into(),
            })?;

        let response = router
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {});
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PeerError::InvalidResponse {
                url,
                message: e.to_string(),
            })?
            .to_bytes();
        Ok((status, headers, body))
    }
}

fn shard_path(device: &Device, hash: &ObjectHash, index: u16) -> String {
    format!("/shard/{}/{}/{}", device.device, hash, index)
}

#[async_trait]
impl PeerClient for RouterPeers {
    async fn head_object(
        &self,
        device: &Device,
        partition: u64,
        name: &str,
    ) -> Result<Option<String>, PeerError> {
        let path = format!("/{}/{}{}", device.device, partition, encode_name(name));
        let request = self.build(Method::HEAD, &path, Vec::new(), Body::empty())?;
        let (status, headers, _) = self.send(device, request).await?;
        if !status.is_success() {
            return Ok(None);
        }
        Ok(headers
            .get(X_TIMESTAMP)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string))
    }

    async fn put_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
        body: Bytes,
    ) -> Result<u16, PeerError> {
        let path = shard_path(device, hash, index);
        let request = self.build(Method::PUT, &path, meta_headers(metadata), Body::from(body))?;
        Ok(self.send(device, request).await?.0.as_u16())
    }

    async fn post_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
    ) -> Result<u16, PeerError> {
        let path = shard_path(device, hash, index);
        let request = self.build(Method::POST, &path, meta_headers(metadata), Body::empty())?;
        Ok(self.send(device, request).await?.0.as_u16())
    }

    async fn delete_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: &str,
    ) -> Result<u16, PeerError> {
        let path = shard_path(device, hash, index);
        let headers = vec![(X_TIMESTAMP.to_string(), timestamp.to_string())];
        let request = self.build(Method::DELETE, &path, headers, Body::empty())?;
        Ok(self.send(device, request).await?.0.as_u16())
    }

    async fn get_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: Option<i64>,
    ) -> Result<Option<(Metadata, Bytes)>, PeerError> {
        let path = shard_path(device, hash, index);
        let headers = timestamp
            .map(|ts| vec![(SHARD_TIMESTAMP_HEADER.to_string(), ts.to_string())])
            .unwrap_or_default();
        let request = self.build(Method::GET, &path, headers, Body::empty())?;
        let (status, headers, body) = self.send(device, request).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PeerError::Status {
                url: path,
                status: status.as_u16(),
            });
        }
        let metadata = metadata_from_headers(
            headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
        );
        Ok(Some((metadata, body)))
    }

    async fn list_partition(
        &self,
        device: &Device,
        partition: u64,
    ) -> Result<Vec<IndexItem>, PeerError> {
        let path = format!("/partition/{}/{}", device.device, partition);
        let request = self.build(Method::GET, &path, Vec::new(), Body::empty())?;
        let (status, _, body) = self.send(device, request).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(PeerError::Status {
                url: path,
                status: status.as_u16(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| PeerError::InvalidResponse {
            url: path,
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
        let path = format!(
            "/nursery/{}/{}/{}/{}",
            device.device, hash, metahash, timestamp
        );
        let request = self.build(Method::POST, &path, Vec::new(), Body::empty())?;
        Ok(self.send(device, request).await?.0.as_u16())
    }

    async fn post_priority_job(
        &self,
        device: &Device,
        job: &PriorityRepJob,
    ) -> Result<u16, PeerError> {
        let body = serde_json::to_vec(job).map_err(|e| PeerError::InvalidResponse {
            url: "/priorityrep".into(),
            message: e.to_string(),
        })?;
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let request = self.build(Method::POST, "/priorityrep", headers, Body::from(body))?;
        Ok(self.send(device, request).await?.0.as_u16())
    }
}

// =========================================================================
// TestCluster
// =========================================================================

/// One server per ring device, all sharing a ring and a [`RouterPeers`].
pub struct TestCluster {
    _dir: TempDir,
    pub peers: Arc<RouterPeers>,
    ring: Arc<StaticRing>,
    engines: HashMap<u32, StorageEngine>,
    routers: HashMap<u32, Router>,
}

impl TestCluster {
    /// `servers` devices; the single partition lives on the first `replicas`.
    pub fn replicated(servers: u32, replicas: usize) -> Self {
        Self::new(single_partition_ring(servers, replicas), Strategy::Replicated)
    }

    /// `servers` devices with a `k + m` layout over the first `k + m`.
    pub fn erasure_coded(servers: u32, k: usize, m: usize, nursery_replicas: usize) -> Self {
        let layout = ErasureLayout::new(k, m, 64).expect("valid test layout");
        Self::new(
            single_partition_ring(servers, k + m),
            Strategy::ErasureCoded {
                layout,
                nursery_replicas,
            },
        )
    }

    /// One engine and router per device of `ring`.
    pub fn new(ring: StaticRing, strategy: Strategy) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let ring = Arc::new(ring);
        let peers = Arc::new(RouterPeers::new(0));

        let mut engines = HashMap::new();
        let mut routers = HashMap::new();
        let mut by_address = HashMap::new();
        for dev in ring.devices() {
            let root = dir.path().join(format!("server{}", dev.id));
            std::fs::create_dir_all(root.join(&dev.device)).expect("device dir");
            let mut config = EngineConfig::new(root);
            config.strategy = strategy.clone();
            config.local_address = Some((dev.ip.clone(), dev.port));
            let engine = StorageEngine::new(config, ring.clone(), peers.clone())
                .expect("engine for test ring");
            let router = StrataServer::new(StrataServerConfig::new(engine.clone())).into_router();
            by_address.insert(dev.replication_url(), router.clone());
            engines.insert(dev.id, engine);
            routers.insert(dev.id, router);
        }
        assert!(peers.routers.set(by_address).is_ok());

        Self {
            _dir: dir,
            peers,
            ring,
            engines,
            routers,
        }
    }

    pub fn engine(&self, id: u32) -> &StorageEngine {
        &self.engines[&id]
    }

    pub fn ring(&self) -> &StaticRing {
        &self.ring
    }

    pub fn hash(&self, object: &str) -> ObjectHash {
        self.engine(1).hash_path(ACCOUNT, CONTAINER, object)
    }

    pub fn partition(&self, object: &str) -> u64 {
        self.ring.partition_for(&self.hash(object))
    }

    /// Ids of the primaries for an object, in replica order.
    pub fn primaries(&self, object: &str) -> Vec<u32> {
        self.ring
            .nodes_for(self.partition(object))
            .iter()
            .map(|d| d.id)
            .collect()
    }

    /// Send a request to the server holding `sd{id}`.
    pub async fn send(&self, id: u32, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.routers[&id]
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {});
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("response body")
            .to_bytes();
        (status, headers, body)
    }

    fn object_path(&self, id: u32, object: &str) -> String {
        let name = encode_name(&format!("/{ACCOUNT}/{CONTAINER}/{object}"));
        format!("/sd{id}/{}{name}", self.partition(object))
    }

    /// Client PUT of an object into the nursery of `sd{id}`.
    pub async fn put_object(&self, id: u32, object: &str, timestamp: &str, data: &[u8]) -> StatusCode {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(self.object_path(id, object))
            .header(X_TIMESTAMP, timestamp)
            .header("Content-Type", "application/test")
            .body(Body::from(data.to_vec()))
            .expect("request");
        self.send(id, request).await.0
    }

    /// Client PUT to every primary, as a proxy would.
    pub async fn put_everywhere(&self, object: &str, timestamp: &str, data: &[u8]) {
        for id in self.primaries(object) {
            assert_eq!(
                self.put_object(id, object, timestamp, data).await,
                StatusCode::CREATED,
                "PUT to sd{id}"
            );
        }
    }

    pub async fn get_object(&self, id: u32, object: &str) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .uri(self.object_path(id, object))
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = self.send(id, request).await;
        (status, body)
    }

    pub async fn head_object(&self, id: u32, object: &str) -> (StatusCode, HeaderMap) {
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(self.object_path(id, object))
            .body(Body::empty())
            .expect("request");
        let (status, headers, _) = self.send(id, request).await;
        (status, headers)
    }

    pub async fn delete_object(&self, id: u32, object: &str, timestamp: &str) -> StatusCode {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(self.object_path(id, object))
            .header(X_TIMESTAMP, timestamp)
            .body(Body::empty())
            .expect("request");
        self.send(id, request).await.0
    }

    /// Nursery PUT of a tombstone, as a proxy forwarding a delete would.
    pub async fn nursery_delete(&self, id: u32, object: &str, timestamp: &str) -> StatusCode {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(format!("/nursery/sd{id}/{}", self.hash(object)))
            .header(X_TIMESTAMP, timestamp)
            .header(DELETION_HEADER, "true")
            .header("Meta-name", format!("/{ACCOUNT}/{CONTAINER}/{object}"))
            .header("Meta-X-Timestamp", timestamp)
            .body(Body::empty())
            .expect("request");
        self.send(id, request).await.0
    }

    /// Index rows of `sd{id}` for the object's partition, over HTTP.
    pub async fn rows(&self, id: u32, object: &str) -> Vec<IndexItem> {
        let request = Request::builder()
            .uri(format!("/partition/sd{id}/{}", self.partition(object)))
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = self.send(id, request).await;
        assert_eq!(status, StatusCode::OK);
        let hash = self.hash(object);
        serde_json::from_slice::<Vec<IndexItem>>(&body)
            .expect("partition listing")
            .into_iter()
            .filter(|row| row.hash == hash)
            .collect()
    }

    /// Run one stabilize pass on `sd{id}`.
    pub async fn stabilize(&self, id: u32) -> PassReport {
        let dev = self.ring.device(id).expect("device in ring");
        self.engine(id).stabilize_device(&dev).await
    }

    /// Stabilize every device until a pass leaves nothing behind, at most
    /// `rounds` times. Returns the number of rounds run.
    pub async fn stabilize_until_quiet(&self, rounds: usize) -> usize {
        let mut ids: Vec<u32> = self.engines.keys().copied().collect();
        ids.sort_unstable();
        for round in 1..=rounds {
            let mut failed = 0;
            for &id in &ids {
                failed += self.stabilize(id).await.failed;
            }
            if failed == 0 {
                return round;
            }
        }
        rounds
    }
}

/// Part power 0: one partition on devices `1..=replicas`, the rest handoffs.
pub fn single_partition_ring(servers: u32, replicas: usize) -> StaticRing {
    StaticRing::from_assignments(
        0,
        replicas,
        (1..=servers).map(device).collect(),
        vec![(1..=replicas as u32).collect()],
    )
    .expect("valid test ring")
}
