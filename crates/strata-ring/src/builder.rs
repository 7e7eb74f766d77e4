//! Deterministic ring construction from a device list.

use std::collections::BTreeMap;

use strata_types::Device;
use tracing::debug;

use crate::error::RingError;
use crate::ring::{MAX_PART_POWER, StaticRing};

/// Builds a [`StaticRing`] by walking a weighted virtual-node circle.
///
/// Each device is placed at `round(weight * vnodes_per_weight)` positions
/// (at least one), determined by `blake3(device_id ++ vnode_index)`. A
/// partition's primaries are the first `replicas` distinct devices found
/// walking clockwise from the partition's start position. Adding or
/// removing one device only reassigns the partitions whose walk crosses
/// its vnodes.
#[derive(Debug, Clone)]
pub struct RingBuilder {
    part_power: u32,
    replicas: usize,
    vnodes_per_weight: u16,
    devices: Vec<Device>,
}

impl RingBuilder {
    /// Start a ring with `2^part_power` partitions and `replicas` primaries each.
    pub fn new(part_power: u32, replicas: usize) -> Self {
        Self {
            part_power,
            replicas,
            vnodes_per_weight: 128,
            devices: Vec::new(),
        }
    }

    /// Override the vnode count for a device of weight 1.
    pub fn vnodes_per_weight(mut self, vnodes: u16) -> Self {
        self.vnodes_per_weight = vnodes.max(1);
        self
    }

    /// Add a device, replacing any existing device with the same id.
    pub fn add_device(&mut self, device: Device) -> &mut Self {
        self.remove_device(device.id);
        debug!(device_id = device.id, device = %device.device, "added device to ring builder");
        self.devices.push(device);
        self
    }

    /// Remove a device by id.
    pub fn remove_device(&mut self, id: u32) -> &mut Self {
        self.devices.retain(|d| d.id != id);
        self
    }

    /// Materialize the partition table.
    pub fn build(&self) -> Result<StaticRing, RingError> {
        if self.part_power > MAX_PART_POWER {
            return Err(RingError::InvalidPartPower(self.part_power));
        }
        if self.devices.len() < self.replicas {
            return Err(RingError::NotEnoughDevices {
                needed: self.replicas,
                available: self.devices.len(),
            });
        }

        let mut vnodes: BTreeMap<u64, u32> = BTreeMap::new();
        for dev in &self.devices {
            let count = (dev.weight * f64::from(self.vnodes_per_weight)).round().max(1.0) as u32;
            for i in 0..count {
                vnodes.insert(vnode_position(dev.id, i), dev.id);
            }
        }

        let partitions = 1u64 << self.part_power;
        let mut assignments = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let pos = partition_position(partition, self.part_power);
            let mut owners: Vec<u32> = Vec::with_capacity(self.replicas);

            let after = vnodes.range(pos..);
            let before = vnodes.range(..pos);
            for (_, &device_id) in after.chain(before) {
                if !owners.contains(&device_id) {
                    owners.push(device_id);
                    if owners.len() == self.replicas {
                        break;
                    }
                }
            }
            assignments.push(owners);
        }

        debug!(
            part_power = self.part_power,
            replicas = self.replicas,
            devices = self.devices.len(),
            vnodes = vnodes.len(),
            "built ring"
        );

        StaticRing::from_assignments(
            self.part_power,
            self.replicas,
            self.devices.clone(),
            assignments,
        )
    }
}

/// A vnode's position on the circle: blake3(device_id ++ vnode_index) truncated to u64.
fn vnode_position(device_id: u32, vnode_index: u32) -> u64 {
    let mut input = [0u8; 8];
    input[..4].copy_from_slice(&device_id.to_le_bytes());
    input[4..].copy_from_slice(&vnode_index.to_le_bytes());
    let hash = blake3::hash(&input);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Start of a partition's slice of the circle.
fn partition_position(partition: u64, part_power: u32) -> u64 {
    if part_power == 0 {
        0
    } else {
        partition << (64 - part_power)
    }
}
