//! Planning of priority replication jobs from ring changes.
//!
//! Both planners are pure: the same rings and arguments always give the
//! same jobs in the same order (partition, then replica slot).

use std::collections::HashSet;

use strata_ring::Ring;
use strata_types::{Device, PriorityRepJob};
use tracing::{debug, warn};

use crate::error::RepairError;

/// Jobs moving every partition slot whose device changed between two rings.
///
/// The source of a job is the slot's old device, or when that device left
/// the cluster, the next device of the old assignment (in replica order,
/// wrapping) that is still in the new ring. Partitions in `excluded` are
/// skipped.
pub fn get_part_move_jobs(
    old_ring: &dyn Ring,
    new_ring: &dyn Ring,
    excluded: &[u64],
    policy: u32,
) -> Result<Vec<PriorityRepJob>, RepairError> {
    if old_ring.part_power() != new_ring.part_power() {
        return Err(RepairError::PartPowerMismatch {
            old: old_ring.part_power(),
            new: new_ring.part_power(),
        });
    }
    let excluded: HashSet<u64> = excluded.iter().copied().collect();

    let mut jobs = Vec::new();
    for partition in 0..new_ring.partition_count() {
        if excluded.contains(&partition) {
            continue;
        }
        let old_nodes = old_ring.nodes_for(partition);
        let new_nodes = new_ring.nodes_for(partition);

        for (slot, to) in new_nodes.iter().enumerate() {
            let Some(old) = old_nodes.get(slot) else {
                continue;
            };
            if old.id == to.id {
                continue;
            }
            let source = (0..old_nodes.len())
                .map(|i| &old_nodes[(slot + i) % old_nodes.len()])
                .find_map(|d| new_ring.device(d.id));
            let Some(from) = source else {
                warn!(partition, slot, "no surviving source for moved partition");
                continue;
            };
            debug!(partition, from = from.id, to = to.id, "part move");
            jobs.push(PriorityRepJob {
                partition,
                from_device: from,
                to_device: to.clone(),
                policy,
            });
        }
    }
    Ok(jobs)
}

/// Jobs refilling a replaced device from the other primaries of each of
/// its partitions.
///
/// Only sources in `region_filter` are used when one is given. Without
/// `all_peers` one source per partition is chosen, preferring a peer in
/// the target's region.
pub fn get_restore_device_jobs(
    ring: &dyn Ring,
    ip: &str,
    device: &str,
    region_filter: Option<u32>,
    all_peers: bool,
    excluded: &[u64],
    policy: u32,
) -> Vec<PriorityRepJob> {
    let excluded: HashSet<u64> = excluded.iter().copied().collect();

    let mut jobs = Vec::new();
    for partition in 0..ring.partition_count() {
        if excluded.contains(&partition) {
            continue;
        }
        let nodes = ring.nodes_for(partition);
        let Some(target) = nodes.iter().find(|d| d.ip == ip && d.device == device) else {
            continue;
        };
        let peers: Vec<&Device> = nodes
            .iter()
            .filter(|d| d.id != target.id)
            .filter(|d| region_filter.is_none_or(|r| d.region == r))
            .collect();

        let sources: Vec<&Device> = if all_peers {
            peers
        } else {
            peers
                .iter()
                .find(|d| d.region == target.region)
                .or(peers.first())
                .copied()
                .into_iter()
                .collect()
        };
        if sources.is_empty() {
            debug!(partition, device, "no eligible source");
        }
        for from in sources {
            jobs.push(PriorityRepJob {
                partition,
                from_device: from.clone(),
                to_device: target.clone(),
                policy,
            });
        }
    }
    jobs
}
