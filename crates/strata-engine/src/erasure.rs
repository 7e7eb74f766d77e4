//! Erasure-coded objects.
//!
//! New writes land as full nursery copies in the [`NURSERY_SHARD`] slot of
//! the first `nursery_replicas` primaries. Stabilization encodes the copy
//! into `k + m` shards, sends shard `i` to primary `i` and drops the
//! nursery rows. Reads of a stable object gather `k` shards and decode.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use strata_erasure::ErasureLayout;
use strata_index::{IndexError, TempFile};
use strata_types::{
    Device, IndexItem, Metadata, Method, NURSERY_SHARD, PriorityRepJob, X_TIMESTAMP,
    parse_timestamp,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::object::{
    Object, ObjectCore, check_status, copy_file, delete_accepted, fan_out, is_local,
    write_accepted,
};

type Result<T> = std::result::Result<T, EngineError>;

/// An object stored as Reed-Solomon shards across the primaries.
pub struct ErasureCodedObject {
    core: ObjectCore,
    layout: ErasureLayout,
    nursery_replicas: usize,
}

impl ErasureCodedObject {
    pub(crate) fn new(core: ObjectCore, layout: ErasureLayout, nursery_replicas: usize) -> Self {
        Self {
            core,
            layout,
            nursery_replicas,
        }
    }

    fn loaded(&self) -> Result<IndexItem> {
        self.core.item.clone().ok_or(EngineError::NotFound)
    }

    fn is_nursery(&self) -> bool {
        self.core.item.as_ref().is_none_or(|i| i.nursery)
    }

    /// Index of this device among the object's primaries.
    fn local_index(&self, nodes: &[Device]) -> Result<usize> {
        let shared = &self.core.shared;
        nodes
            .iter()
            .position(|n| shared.is_local_device(n, &self.core.device))
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "{} is not a primary for {}",
                    self.core.device, self.core.hash
                ))
            })
    }

    /// Commit one stable shard on this device. A newer local version wins.
    fn commit_local_shard(&mut self, index: u16, metadata: &Metadata, data: &[u8]) -> Result<()> {
        let mut shard = ObjectCore::new(
            self.core.shared.clone(),
            self.core.idb.clone(),
            self.core.device.clone(),
            self.core.hash,
            None,
        )?;
        let temp = shard.set_data(index, data.len() as u64)?;
        std::io::Write::write_all(temp, data)?;
        match shard.commit(index, Method::Put, metadata.clone(), false, false) {
            Ok(()) => Ok(()),
            Err(EngineError::Index(IndexError::Conflict { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Collect at least `k` shard streams of the stored version.
    async fn gather_shards(&self, item: &IndexItem) -> Result<Vec<(u8, Vec<u8>)>> {
        let (_, nodes) = self.core.placement();
        let needed = self.layout.data_shards;
        let mut shards: Vec<(u8, Vec<u8>)> = Vec::with_capacity(needed);

        if !item.deletion && !item.nursery {
            shards.push((item.shard as u8, self.core.read_data().await?.to_vec()));
        }
        for (index, node) in nodes.iter().enumerate() {
            if shards.len() >= needed {
                break;
            }
            if index == item.shard as usize && !item.nursery {
                continue;
            }
            match self
                .core
                .shared
                .peers
                .get_shard(node, &item.hash, index as u16, Some(item.timestamp))
                .await
            {
                Ok(Some((_, body))) => shards.push((index as u8, body.to_vec())),
                Ok(None) => debug!(node = %node.device, index, "shard missing"),
                Err(e) => warn!(node = %node.device, index, error = %e, "shard fetch failed"),
            }
        }
        Ok(shards)
    }

    async fn decode_stable(&self) -> Result<Vec<u8>> {
        let item = self.loaded()?;
        let shards = self.gather_shards(&item).await?;
        Ok(self
            .layout
            .decode_object(&shards, self.core.content_length())?)
    }

    /// POST metadata of a stable shard to the other shard holders.
    async fn restabilize(&mut self, local: &Device, item: &IndexItem) -> Result<()> {
        let (_, nodes) = self.core.placement();
        let others: Vec<(u16, Device)> = nodes
            .into_iter()
            .enumerate()
            .filter(|(_, n)| !is_local(n, local))
            .map(|(i, n)| (i as u16, n))
            .collect();
        let expected = others.len();

        let peers = self.core.shared.peers.clone();
        let hash = self.core.hash;
        let metadata = self.core.metadata.clone();
        let indexed: BTreeMap<u32, u16> = others.iter().map(|(i, n)| (n.id, *i)).collect();
        let accepted = fan_out(
            others.into_iter().map(|(_, n)| n).collect(),
            move |node| {
                let peers = peers.clone();
                let metadata = metadata.clone();
                let index = indexed.get(&node.id).copied().unwrap_or_default();
                async move { peers.post_shard(&node, &hash, index, &metadata).await }
            },
            write_accepted,
        )
        .await;

        if accepted != expected {
            return Err(EngineError::NotStabilized(format!(
                "restabilized {accepted}/{expected} shards"
            )));
        }
        self.core
            .idb
            .set_stabilized(&item.hash, item.shard, item.timestamp, false)?;
        debug!(hash = %item.hash, shard = item.shard, "restabilized shard metadata");
        Ok(())
    }

    /// Remove every shard of the object, then the nursery tombstone.
    async fn stabilize_delete(&mut self, local: &Device, item: &IndexItem) -> Result<()> {
        let (_, nodes) = self.core.placement();
        let timestamp = self.core.timestamp_header();
        let total = nodes.len();
        let mut done = 0;

        for (index, node) in nodes.iter().enumerate() {
            let index = index as u16;
            if is_local(node, local) {
                if let Some(shard) = self.core.idb.lookup(&item.hash, index, true)?
                    && shard.timestamp <= item.timestamp
                {
                    self.core.idb.remove(
                        &shard.hash,
                        shard.shard,
                        shard.timestamp,
                        shard.nursery,
                        &shard.metahash,
                    )?;
                }
                done += 1;
                continue;
            }
            match self
                .core
                .shared
                .peers
                .delete_shard(node, &item.hash, index, &timestamp)
                .await
            {
                Ok(status) if delete_accepted(status) => done += 1,
                Ok(status) => debug!(node = %node.device, status, "shard delete rejected"),
                Err(e) => warn!(node = %node.device, error = %e, "shard delete failed"),
            }
        }

        if done != total {
            return Err(EngineError::NotStabilized(format!(
                "deleted {done}/{total} shards"
            )));
        }
        self.core.remove_item()?;
        debug!(hash = %item.hash, "stabilized delete");
        Ok(())
    }

    /// Encode the nursery copy and place shard `i` on primary `i`.
    async fn stabilize_nursery(&mut self, local: &Device, item: &IndexItem) -> Result<()> {
        let (_, nodes) = self.core.placement();
        let data = self.core.read_data().await?;
        let streams = self.layout.encode_object(&data)?;
        let metadata = self.core.metadata.clone();

        let mut stored = 0;
        for (index, (node, stream)) in nodes.iter().zip(streams).enumerate() {
            let index = index as u16;
            if is_local(node, local) {
                match self.commit_local_shard(index, &metadata, &stream) {
                    Ok(()) => stored += 1,
                    Err(e) => warn!(index, error = %e, "local shard commit failed"),
                }
                continue;
            }
            match self
                .core
                .shared
                .peers
                .put_shard(node, &item.hash, index, &metadata, Bytes::from(stream))
                .await
            {
                Ok(status) if write_accepted(status) => stored += 1,
                Ok(status) => debug!(node = %node.device, index, status, "shard put rejected"),
                Err(e) => warn!(node = %node.device, index, error = %e, "shard put failed"),
            }
        }

        let cache = &self.core.shared.cache;
        if stored != nodes.len() {
            cache.update_item_stabilized(&self.core.device, &item.hash, &item.metahash, false);
            return Err(EngineError::NotStabilized(format!(
                "stored {stored}/{} shards",
                nodes.len()
            )));
        }

        for node in nodes.iter().take(self.nursery_replicas) {
            if is_local(node, local) {
                continue;
            }
            match self
                .core
                .shared
                .peers
                .post_nursery(node, &item.hash, &item.metahash, item.timestamp)
                .await
            {
                Ok(status) => debug!(node = %node.device, status, "notified nursery holder"),
                Err(e) => warn!(node = %node.device, error = %e, "nursery notification failed"),
            }
        }

        cache.update_item_stabilized(&self.core.device, &item.hash, &item.metahash, true);
        self.core.remove_item()?;
        info!(hash = %item.hash, shards = nodes.len(), "stabilized erasure-coded object");
        Ok(())
    }
}

#[async_trait]
impl Object for ErasureCodedObject {
    fn exists(&self) -> bool {
        self.core.exists()
    }

    fn metadata(&self) -> &Metadata {
        &self.core.metadata
    }

    fn content_length(&self) -> u64 {
        self.core.content_length()
    }

    fn repr(&self) -> String {
        self.core.repr("ErasureCodedObject")
    }

    fn item(&self) -> Option<&IndexItem> {
        self.core.item.as_ref()
    }

    async fn copy(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        if self.is_nursery() {
            return copy_file(self.core.data_path()?, w, 0, None).await;
        }
        let data = self.decode_stable().await?;
        w.write_all(&data).await?;
        w.flush().await?;
        Ok(data.len() as u64)
    }

    async fn copy_range(
        &self,
        w: &mut (dyn AsyncWrite + Unpin + Send),
        start: u64,
        end: u64,
    ) -> Result<u64> {
        if self.is_nursery() {
            return copy_file(self.core.data_path()?, w, start, Some(end.saturating_sub(start)))
                .await;
        }
        let data = self.decode_stable().await?;
        let end = (end as usize).min(data.len());
        let start = (start as usize).min(end);
        w.write_all(&data[start..end]).await?;
        w.flush().await?;
        Ok((end - start) as u64)
    }

    fn set_data(&mut self, size: u64) -> Result<&mut TempFile> {
        self.core.set_data(NURSERY_SHARD, size)
    }

    async fn commit(&mut self, metadata: Metadata) -> Result<()> {
        self.core
            .commit(NURSERY_SHARD, Method::Put, metadata, true, false)
    }

    async fn delete(&mut self, metadata: Metadata) -> Result<()> {
        self.core
            .commit(NURSERY_SHARD, Method::Delete, metadata, true, false)
    }

    async fn commit_metadata(&mut self, metadata: Metadata) -> Result<()> {
        let item = self.loaded()?;
        self.core
            .commit(item.shard, Method::Post, metadata, item.nursery, !item.nursery)
    }

    async fn quarantine(&mut self) -> Result<()> {
        self.core.quarantine()
    }

    #[tracing::instrument(skip(self, job), fields(hash = %self.core.hash, partition = job.partition, to = %job.to_device.device))]
    async fn replicate(&mut self, job: &PriorityRepJob) -> Result<()> {
        let item = self.loaded()?;
        let peers = &self.core.shared.peers;
        let to = &job.to_device;
        if item.deletion {
            let status = peers
                .delete_shard(to, &item.hash, item.shard, &self.core.timestamp_header())
                .await?;
            check_status(to, status, delete_accepted)?;
        } else {
            let body = self.core.read_data().await?;
            let status = peers
                .put_shard(to, &item.hash, item.shard, &self.core.metadata, body)
                .await?;
            check_status(to, status, write_accepted)?;
        }

        let (_, handoff) = self
            .core
            .shared
            .ring
            .job_nodes(job.partition, job.from_device.id);
        if handoff {
            self.core.remove_item()?;
            debug!("removed handoff shard after replication");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, device), fields(hash = %self.core.hash, device = %device.device))]
    async fn stabilize(&mut self, device: &Device) -> Result<()> {
        let Some(item) = self.core.item.clone() else {
            return Ok(());
        };
        if !item.nursery {
            if item.restabilize {
                return self.restabilize(device, &item).await;
            }
            return Ok(());
        }
        if self
            .core
            .shared
            .cache
            .is_stabilized(&device.device, &item.hash, &item.metahash)
        {
            debug!("already stabilized elsewhere");
            return Ok(());
        }
        if item.deletion {
            return self.stabilize_delete(device, &item).await;
        }
        self.stabilize_nursery(device, &item).await
    }

    #[tracing::instrument(skip(self), fields(hash = %self.core.hash, device = %self.core.device))]
    async fn reconstruct(&mut self) -> Result<()> {
        let (_, nodes) = self.core.placement();
        let index = self.local_index(&nodes)?;

        // Group surviving shards by version and keep the newest decodable one.
        let mut versions: BTreeMap<i64, (Metadata, Vec<(u8, Vec<u8>)>)> = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if i == index {
                continue;
            }
            match self
                .core
                .shared
                .peers
                .get_shard(node, &self.core.hash, i as u16, None)
                .await
            {
                Ok(Some((metadata, body))) => {
                    let Some(ts) = metadata
                        .get(X_TIMESTAMP)
                        .and_then(|t| parse_timestamp(t).ok())
                    else {
                        warn!(node = %node.device, "shard without timestamp");
                        continue;
                    };
                    let entry = versions
                        .entry(ts)
                        .or_insert_with(|| (metadata.clone(), Vec::new()));
                    entry.1.push((i as u8, body.to_vec()));
                }
                Ok(None) => debug!(node = %node.device, index = i, "shard missing"),
                Err(e) => warn!(node = %node.device, index = i, error = %e, "shard fetch failed"),
            }
        }

        let best = versions.values().map(|(_, s)| s.len()).max().unwrap_or(0);
        let Some((ts, (metadata, shards))) = versions
            .into_iter()
            .rev()
            .find(|(_, (_, shards))| shards.len() >= self.layout.data_shards)
        else {
            return Err(EngineError::Erasure(
                strata_erasure::ErasureError::NotEnoughShards {
                    needed: self.layout.data_shards,
                    got: best,
                },
            ));
        };

        let content_length = metadata
            .get(strata_types::CONTENT_LENGTH)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| EngineError::Integrity("shard without content length".into()))?;
        let rebuilt = self
            .layout
            .reconstruct_shard(&shards, content_length, index as u8)?;
        self.commit_local_shard(index as u16, &metadata, &rebuilt)?;
        self.core.reload(index as u16)?;
        info!(index, timestamp = ts, "reconstructed shard");
        Ok(())
    }
}
