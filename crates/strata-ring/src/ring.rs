//! The ring contract and the static partition table.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_types::{Device, ObjectHash};
use tracing::debug;

use crate::error::RingError;

/// Largest supported partition power.
pub(crate) const MAX_PART_POWER: u32 = 32;

/// Partition → device mapping consumed by the storage engine.
pub trait Ring: Send + Sync {
    /// Number of hash bits that select a partition.
    fn part_power(&self) -> u32;

    /// Number of primary devices per partition.
    fn replica_count(&self) -> usize;

    /// Ordered primary devices for a partition.
    fn nodes_for(&self, partition: u64) -> Vec<Device>;

    /// Handoff devices for a partition, in preference order.
    fn more_nodes(&self, partition: u64) -> Vec<Device>;

    /// Every device in the ring.
    fn devices(&self) -> Vec<Device>;

    /// Total number of partitions.
    fn partition_count(&self) -> u64 {
        1u64 << self.part_power()
    }

    /// Partition owning a hash: its top `part_power` bits.
    fn partition_for(&self, hash: &ObjectHash) -> u64 {
        hash.partition(self.part_power())
    }

    /// Peers a device must talk to for a partition.
    ///
    /// Returns the other primaries when `device_id` is a primary, or all
    /// primaries with `is_handoff = true` when it is not.
    fn job_nodes(&self, partition: u64, device_id: u32) -> (Vec<Device>, bool) {
        let nodes = self.nodes_for(partition);
        if nodes.iter().any(|n| n.id == device_id) {
            let others = nodes.into_iter().filter(|n| n.id != device_id).collect();
            (others, false)
        } else {
            (nodes, true)
        }
    }

    /// Devices served by the server at `ip:port`.
    fn local_devices(&self, ip: &str, port: u16) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(|d| d.ip == ip && d.port == port)
            .collect()
    }

    /// Look up a device by id.
    fn device(&self, id: u32) -> Option<Device> {
        self.devices().into_iter().find(|d| d.id == id)
    }
}

/// A fully materialized partition table.
///
/// `assignments[p]` lists the device ids of partition `p`'s primaries in
/// replica order. Serialized as JSON for ring files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRing {
    part_power: u32,
    replicas: usize,
    devices: Vec<Device>,
    assignments: Vec<Vec<u32>>,
    #[serde(skip)]
    index: HashMap<u32, usize>,
}

impl StaticRing {
    /// Build a ring from an explicit assignment table.
    pub fn from_assignments(
        part_power: u32,
        replicas: usize,
        devices: Vec<Device>,
        assignments: Vec<Vec<u32>>,
    ) -> Result<Self, RingError> {
        let mut ring = Self {
            part_power,
            replicas,
            devices,
            assignments,
            index: HashMap::new(),
        };
        ring.validate()?;
        Ok(ring)
    }

    /// Parse and validate a JSON ring.
    pub fn from_json(json: &str) -> Result<Self, RingError> {
        let mut ring: StaticRing = serde_json::from_str(json)?;
        ring.validate()?;
        Ok(ring)
    }

    /// Load a JSON ring file.
    pub fn load(path: &Path) -> Result<Self, RingError> {
        let contents = std::fs::read_to_string(path)?;
        let ring = Self::from_json(&contents)?;
        debug!(
            path = %path.display(),
            part_power = ring.part_power,
            devices = ring.devices.len(),
            "loaded ring"
        );
        Ok(ring)
    }

    /// Write the ring as JSON.
    pub fn save(&self, path: &Path) -> Result<(), RingError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Raw device ids assigned to a partition.
    pub fn assignment(&self, partition: u64) -> &[u32] {
        self.assignments
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the ring contains a device with this id.
    pub fn contains_device(&self, id: u32) -> bool {
        self.index.contains_key(&id)
    }

    fn device_ref(&self, id: u32) -> Option<&Device> {
        self.index.get(&id).map(|&i| &self.devices[i])
    }

    fn validate(&mut self) -> Result<(), RingError> {
        if self.part_power > MAX_PART_POWER {
            return Err(RingError::InvalidPartPower(self.part_power));
        }

        self.index.clear();
        for (i, dev) in self.devices.iter().enumerate() {
            if self.index.insert(dev.id, i).is_some() {
                return Err(RingError::DuplicateDevice(dev.id));
            }
        }

        let expected = 1u64 << self.part_power;
        if self.assignments.len() as u64 != expected {
            return Err(RingError::PartitionCount {
                expected,
                got: self.assignments.len(),
            });
        }

        for (partition, ids) in self.assignments.iter().enumerate() {
            let partition = partition as u64;
            if ids.len() != self.replicas {
                return Err(RingError::ReplicaCount {
                    partition,
                    expected: self.replicas,
                    got: ids.len(),
                });
            }
            let mut seen = HashSet::with_capacity(ids.len());
            for &device_id in ids {
                if !self.index.contains_key(&device_id) {
                    return Err(RingError::UnknownDevice {
                        partition,
                        device_id,
                    });
                }
                if !seen.insert(device_id) {
                    return Err(RingError::DuplicateAssignment {
                        partition,
                        device_id,
                    });
                }
            }
        }

        Ok(())
    }
}

impl Ring for StaticRing {
    fn part_power(&self) -> u32 {
        self.part_power
    }

    fn replica_count(&self) -> usize {
        self.replicas
    }

    fn nodes_for(&self, partition: u64) -> Vec<Device> {
        self.assignment(partition)
            .iter()
            .filter_map(|&id| self.device_ref(id).cloned())
            .collect()
    }

    fn more_nodes(&self, partition: u64) -> Vec<Device> {
        let primaries = self.assignment(partition);
        let mut handoffs: Vec<&Device> = self
            .devices
            .iter()
            .filter(|d| !primaries.contains(&d.id))
            .collect();
        handoffs.sort_by_key(|d| (handoff_position(partition, d.id), d.id));
        handoffs.into_iter().cloned().collect()
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.clone()
    }

    fn device(&self, id: u32) -> Option<Device> {
        self.device_ref(id).cloned()
    }
}

/// Handoff order for a device: blake3(partition ++ device_id) truncated to u64.
fn handoff_position(partition: u64, device_id: u32) -> u64 {
    let mut input = [0u8; 12];
    input[..8].copy_from_slice(&partition.to_le_bytes());
    input[8..].copy_from_slice(&device_id.to_le_bytes());
    let hash = blake3::hash(&input);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
pub(crate) fn test_device(id: u32) -> Device {
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
