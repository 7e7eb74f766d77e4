//! Peer-to-peer HTTP calls between object servers.
//!
//! Every status code is returned to the caller: the stabilize and
//! replicate paths decide per call whether 404 or 409 counts as success.
//! Only transport failures are errors.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, StatusCode};
use strata_types::{
    Device, IndexItem, META_PREFIX, Metadata, ObjectHash, PriorityRepJob, X_TIMESTAMP,
    metadata_key_from_header,
};
use tracing::trace;

/// Header selecting the storage policy on the receiving server.
pub const POLICY_HEADER: &str = "X-Backend-Storage-Policy-Index";

/// Header selecting a specific shard version on GET.
pub const SHARD_TIMESTAMP_HEADER: &str = "X-Shard-Timestamp";

/// Header carrying the tombstone flag of a nursery PUT.
pub const DELETION_HEADER: &str = "Deletion";

/// Escaped in object names; `/` keeps separating path segments.
const NAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode an object name such as `/a/c/o` for a URL path.
pub fn encode_name(name: &str) -> String {
    utf8_percent_encode(name, NAME_ESCAPE).to_string()
}

/// Errors from peer requests.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The request never produced a response.
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The peer answered with an unexpected status.
    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    /// The response body could not be decoded.
    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

/// Calls one object server makes on another.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// HEAD an object on the object-server surface. Returns its
    /// `X-Timestamp` when the peer answers 2xx with one.
    async fn head_object(
        &self,
        device: &Device,
        partition: u64,
        name: &str,
    ) -> Result<Option<String>, PeerError>;

    /// Write a stable shard.
    async fn put_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
        body: Bytes,
    ) -> Result<u16, PeerError>;

    /// Replace a stable shard's metadata.
    async fn post_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
    ) -> Result<u16, PeerError>;

    /// Remove a stable shard older than `timestamp`.
    async fn delete_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: &str,
    ) -> Result<u16, PeerError>;

    /// Read a stable shard, optionally a specific version. `None` on 404.
    async fn get_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: Option<i64>,
    ) -> Result<Option<(Metadata, Bytes)>, PeerError>;

    /// Index rows of one partition. A 404 is an empty listing.
    async fn list_partition(
        &self,
        device: &Device,
        partition: u64,
    ) -> Result<Vec<IndexItem>, PeerError>;

    /// Tell a peer an object was stabilized elsewhere.
    async fn post_nursery(
        &self,
        device: &Device,
        hash: &ObjectHash,
        metahash: &str,
        timestamp: i64,
    ) -> Result<u16, PeerError>;

    /// Ask a server to run a priority replication job.
    async fn post_priority_job(
        &self,
        device: &Device,
        job: &PriorityRepJob,
    ) -> Result<u16, PeerError>;
}

/// `X-Timestamp` plus one `Meta-*` header per metadata entry.
pub fn meta_headers(metadata: &Metadata) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(metadata.len() + 1);
    if let Some(ts) = metadata.get(X_TIMESTAMP) {
        headers.push((X_TIMESTAMP.to_string(), ts.clone()));
    }
    for (k, v) in metadata {
        headers.push((format!("{META_PREFIX}{k}"), v.clone()));
    }
    headers
}

/// Collect `Meta-*` headers back into metadata.
pub fn metadata_from_headers<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        if name.len() > META_PREFIX.len()
            && name[..META_PREFIX.len()].eq_ignore_ascii_case(META_PREFIX)
        {
            let key = metadata_key_from_header(&name[META_PREFIX.len()..]);
            metadata.insert(key, value.to_string());
        }
    }
    metadata
}

/// Whether a status counts as success for a write.
pub(crate) fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// [`PeerClient`] over HTTP.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client,
    policy: u32,
}

impl HttpPeerClient {
    pub fn new(policy: u32, timeout: Duration) -> Result<Self, PeerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PeerError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client, policy })
    }

    fn shard_url(device: &Device, hash: &ObjectHash, index: u16) -> String {
        format!(
            "{}/shard/{}/{}/{}",
            device.replication_url(),
            device.device,
            hash,
            index
        )
    }

    fn with_meta(
        &self,
        mut request: reqwest::RequestBuilder,
        metadata: &Metadata,
    ) -> reqwest::RequestBuilder {
        request = request.header(POLICY_HEADER, self.policy.to_string());
        for (k, v) in meta_headers(metadata) {
            request = request.header(k, v);
        }
        request
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response, PeerError> {
        let response = request.send().await.map_err(|e| PeerError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        trace!(url, status = response.status().as_u16(), "peer response");
        Ok(response)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn head_object(
        &self,
        device: &Device,
        partition: u64,
        name: &str,
    ) -> Result<Option<String>, PeerError> {
        let url = format!(
            "{}/{}/{}{}",
            device.replication_url(),
            device.device,
            partition,
            encode_name(name)
        );
        let request = self
            .client
            .head(&url)
            .header(POLICY_HEADER, self.policy.to_string())
            .header(reqwest::header::USER_AGENT, "nursery-stabilizer");
        let response = self.send(&url, request).await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(response
            .headers()
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
        let url = Self::shard_url(device, hash, index);
        let request = self.with_meta(self.client.put(&url), metadata).body(body);
        Ok(self.send(&url, request).await?.status().as_u16())
    }

    async fn post_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        metadata: &Metadata,
    ) -> Result<u16, PeerError> {
        let url = Self::shard_url(device, hash, index);
        let request = self.with_meta(self.client.post(&url), metadata);
        Ok(self.send(&url, request).await?.status().as_u16())
    }

    async fn delete_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: &str,
    ) -> Result<u16, PeerError> {
        let url = Self::shard_url(device, hash, index);
        let request = self
            .client
            .delete(&url)
            .header(POLICY_HEADER, self.policy.to_string())
            .header(X_TIMESTAMP, timestamp);
        Ok(self.send(&url, request).await?.status().as_u16())
    }

    async fn get_shard(
        &self,
        device: &Device,
        hash: &ObjectHash,
        index: u16,
        timestamp: Option<i64>,
    ) -> Result<Option<(Metadata, Bytes)>, PeerError> {
        let url = Self::shard_url(device, hash, index);
        let mut request = self
            .client
            .get(&url)
            .header(POLICY_HEADER, self.policy.to_string());
        if let Some(ts) = timestamp {
            request = request.header(SHARD_TIMESTAMP_HEADER, ts.to_string());
        }
        let response = self.send(&url, request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(PeerError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        let metadata = metadata_from_headers(
            response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
        );
        let body = response.bytes().await.map_err(|e| PeerError::InvalidResponse {
            url: url.clone(),
            message: e.to_string(),
        })?;
        Ok(Some((metadata, body)))
    }

    async fn list_partition(
        &self,
        device: &Device,
        partition: u64,
    ) -> Result<Vec<IndexItem>, PeerError> {
        let url = format!(
            "{}/partition/{}/{}",
            device.replication_url(),
            device.device,
            partition
        );
        let request = self
            .client
            .get(&url)
            .header(POLICY_HEADER, self.policy.to_string());
        let response = self.send(&url, request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(PeerError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        response
            .json::<Vec<IndexItem>>()
            .await
            .map_err(|e| PeerError::InvalidResponse {
                url,
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
        let url = format!(
            "{}/nursery/{}/{}/{}/{}",
            device.replication_url(),
            device.device,
            hash,
            metahash,
            timestamp
        );
        let request = self
            .client
            .post(&url)
            .header(POLICY_HEADER, self.policy.to_string());
        Ok(self.send(&url, request).await?.status().as_u16())
    }

    async fn post_priority_job(
        &self,
        device: &Device,
        job: &PriorityRepJob,
    ) -> Result<u16, PeerError> {
        let url = format!("{}/priorityrep", device.replication_url());
        let request = self
            .client
            .post(&url)
            .header(POLICY_HEADER, self.policy.to_string())
            .json(job);
        Ok(self.send(&url, request).await?.status().as_u16())
    }
}
