//! Fully replicated objects.
//!
//! Every primary stores the whole object at shard 0. A nursery copy becomes
//! stable once every primary reports the same `X-Timestamp`.

use async_trait::async_trait;
use bytes::Bytes;
use strata_index::TempFile;
use strata_types::{Device, IndexItem, Metadata, Method, NAME, PriorityRepJob};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::object::{
    Object, ObjectCore, check_status, copy_file, delete_accepted, fan_out, is_local,
    write_accepted,
};

type Result<T> = std::result::Result<T, EngineError>;

/// Shard slot of replicated objects.
pub(crate) const REPLICATED_SHARD: u16 = 0;

/// An object stored as identical full copies on every primary.
pub struct ReplicatedObject {
    core: ObjectCore,
}

impl ReplicatedObject {
    pub(crate) fn new(core: ObjectCore) -> Self {
        Self { core }
    }

    fn loaded(&self) -> Result<IndexItem> {
        self.core.item.clone().ok_or(EngineError::NotFound)
    }

    /// HEAD every other primary. Returns the agreeing count (self
    /// included) and the primaries that disagree.
    async fn check_quorum(
        &self,
        local: &Device,
        partition: u64,
        nodes: &[Device],
        item: &IndexItem,
    ) -> Result<(usize, Vec<Device>)> {
        let name = self
            .core
            .metadata
            .get(NAME)
            .ok_or_else(|| EngineError::Validation(format!("{} has no name", item.hash)))?;

        let local_ts = self.core.timestamp_header();
        let mut good = 0;
        let mut missing = Vec::new();
        for node in nodes {
            if is_local(node, local) {
                good += 1;
                continue;
            }
            match self.core.shared.peers.head_object(node, partition, name).await {
                Ok(Some(ts)) if ts == local_ts => good += 1,
                Ok(_) => missing.push(node.clone()),
                Err(e) => {
                    debug!(node = %node.device, error = %e, "quorum check failed");
                    missing.push(node.clone());
                }
            }
        }
        Ok((good, missing))
    }

    /// POST metadata to every other primary, then clear the flag.
    async fn restabilize(&mut self, local: &Device, item: &IndexItem) -> Result<()> {
        let (_, nodes) = self.core.placement();
        let others: Vec<Device> = nodes.into_iter().filter(|n| !is_local(n, local)).collect();
        let expected = others.len();

        let peers = self.core.shared.peers.clone();
        let hash = self.core.hash;
        let metadata = self.core.metadata.clone();
        let accepted = fan_out(
            others,
            move |node| {
                let peers = peers.clone();
                let metadata = metadata.clone();
                async move {
                    peers
                        .post_shard(&node, &hash, REPLICATED_SHARD, &metadata)
                        .await
                }
            },
            write_accepted,
        )
        .await;

        if accepted != expected {
            return Err(EngineError::NotStabilized(format!(
                "restabilized {accepted}/{expected} primaries"
            )));
        }
        self.core
            .idb
            .set_stabilized(&item.hash, item.shard, item.timestamp, false)?;
        debug!(hash = %item.hash, "restabilized metadata");
        Ok(())
    }

    /// Push a nursery tombstone to the other primaries, then drop it.
    async fn stabilize_delete(&mut self, local: &Device, item: &IndexItem) -> Result<()> {
        let (_, nodes) = self.core.placement();
        let total = nodes.len();
        let others: Vec<Device> = nodes.into_iter().filter(|n| !is_local(n, local)).collect();

        let peers = self.core.shared.peers.clone();
        let hash = self.core.hash;
        let timestamp = self.core.timestamp_header();
        let accepted = fan_out(
            others,
            move |node| {
                let peers = peers.clone();
                let timestamp = timestamp.clone();
                async move {
                    peers
                        .delete_shard(&node, &hash, REPLICATED_SHARD, &timestamp)
                        .await
                }
            },
            delete_accepted,
        )
        .await;

        if accepted + 1 < total {
            return Err(EngineError::NotStabilized(format!(
                "delete reached {accepted}/{} primaries",
                total.saturating_sub(1)
            )));
        }
        self.core.remove_item()?;
        debug!(hash = %item.hash, "stabilized delete");
        Ok(())
    }

    /// Send the loaded version to one device.
    async fn push_to(&self, to: &Device) -> Result<()> {
        let item = self.loaded()?;
        let peers = &self.core.shared.peers;
        if item.deletion {
            let status = peers
                .delete_shard(to, &item.hash, REPLICATED_SHARD, &self.core.timestamp_header())
                .await?;
            check_status(to, status, delete_accepted)
        } else {
            let body: Bytes = self.core.read_data().await?;
            let status = peers
                .put_shard(to, &item.hash, REPLICATED_SHARD, &self.core.metadata, body)
                .await?;
            check_status(to, status, write_accepted)
        }
    }
}

#[async_trait]
impl Object for ReplicatedObject {
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
        self.core.repr("ReplicatedObject")
    }

    fn item(&self) -> Option<&IndexItem> {
        self.core.item.as_ref()
    }

    async fn copy(&self, w: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        copy_file(self.core.data_path()?, w, 0, None).await
    }

    async fn copy_range(
        &self,
        w: &mut (dyn AsyncWrite + Unpin + Send),
        start: u64,
        end: u64,
    ) -> Result<u64> {
        copy_file(self.core.data_path()?, w, start, Some(end.saturating_sub(start))).await
    }

    fn set_data(&mut self, size: u64) -> Result<&mut TempFile> {
        self.core.set_data(REPLICATED_SHARD, size)
    }

    async fn commit(&mut self, metadata: Metadata) -> Result<()> {
        self.core
            .commit(REPLICATED_SHARD, Method::Put, metadata, true, false)
    }

    async fn delete(&mut self, metadata: Metadata) -> Result<()> {
        self.core
            .commit(REPLICATED_SHARD, Method::Delete, metadata, true, false)
    }

    async fn commit_metadata(&mut self, metadata: Metadata) -> Result<()> {
        let nursery = self.loaded()?.nursery;
        self.core
            .commit(REPLICATED_SHARD, Method::Post, metadata, nursery, !nursery)
    }

    async fn quarantine(&mut self) -> Result<()> {
        self.core.quarantine()
    }

    #[tracing::instrument(skip(self, job), fields(hash = %self.core.hash, partition = job.partition, to = %job.to_device.device))]
    async fn replicate(&mut self, job: &PriorityRepJob) -> Result<()> {
        self.push_to(&job.to_device).await?;

        let (_, handoff) = self
            .core
            .shared
            .ring
            .job_nodes(job.partition, job.from_device.id);
        if handoff {
            self.core.remove_item()?;
            debug!("removed handoff copy after replication");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, device), fields(hash = %self.core.hash, device = %device.device))]
    async fn stabilize(&mut self, device: &Device) -> Result<()> {
        let Some(item) = self.core.item.clone() else {
            return Ok(());
        };
        if item.restabilize {
            return self.restabilize(device, &item).await;
        }
        if !item.nursery {
            return Ok(());
        }
        if item.deletion {
            return self.stabilize_delete(device, &item).await;
        }

        let (partition, nodes) = self.core.placement();
        let replicas = self.core.shared.ring.replica_count();
        let (good, missing) = self.check_quorum(device, partition, &nodes, &item).await?;

        if good == replicas {
            let (_, handoff) = self.core.shared.ring.job_nodes(partition, device.id);
            if handoff {
                if !self.core.shared.config.handoff_trusts_ring {
                    let (again, _) = self.check_quorum(device, partition, &nodes, &item).await?;
                    if again != replicas {
                        return Err(EngineError::NotStabilized(format!(
                            "quorum dropped to {again}/{replicas} before handoff removal"
                        )));
                    }
                }
                self.core.remove_item()?;
                info!("removed stabilized handoff copy");
            } else {
                self.core.idb.set_stabilized(
                    &item.hash,
                    REPLICATED_SHARD,
                    item.timestamp,
                    true,
                )?;
                debug!("stabilized");
            }
            return Ok(());
        }

        let mut fixed = 0;
        let mut first_error = None;
        for node in &missing {
            match self.push_to(node).await {
                Ok(()) => fixed += 1,
                Err(e) => {
                    warn!(node = %node.device, error = %e, "replication to primary failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Err(EngineError::NotStabilized(format!("fixed {fixed} nodes"))),
        }
    }
}
