//! TOML configuration for the Strata daemon.
//!
//! Every section is optional; missing keys take the defaults below. When no
//! config file is given, `stratad.toml` in the user's config directory is
//! used if it exists.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use strata_engine::{EngineConfig, Strategy};
use strata_erasure::ErasureLayout;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Devices and addresses of this server.
    pub node: NodeSection,
    /// Ring file and hash path salt.
    pub ring: RingSection,
    /// Storage policy served by this daemon.
    pub policy: PolicySection,
    /// Stabilizer tuning.
    pub stabilize: StabilizeSection,
    /// Replication and peer traffic tuning.
    pub replication: ReplicationSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding one subdirectory per mounted device.
    pub devices: PathBuf,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// This server's address as it appears in the ring. When unset, every
    /// ring device mounted under `devices` is treated as local.
    pub ip: Option<String>,
    pub port: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            devices: PathBuf::from("/srv/node"),
            bind_addr: "0.0.0.0:6000".to_string(),
            ip: None,
            port: 6000,
        }
    }
}

/// `[ring]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RingSection {
    /// JSON ring file.
    pub path: PathBuf,
    pub hash_path_prefix: String,
    pub hash_path_suffix: String,
}

impl Default for RingSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/strata/object.ring.json"),
            hash_path_prefix: String::new(),
            hash_path_suffix: String::new(),
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub index: u32,
    /// `"replicated"` or `"erasure"`.
    pub kind: String,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Bytes per erasure-coded chunk.
    pub chunk_size: usize,
    /// Primaries receiving full nursery copies of erasure-coded objects.
    pub nursery_replicas: usize,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            index: 0,
            kind: "replicated".to_string(),
            data_shards: 4,
            parity_shards: 2,
            chunk_size: 1024 * 1024,
            nursery_replicas: 3,
        }
    }
}

/// `[stabilize]` section. Durations are in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StabilizeSection {
    /// Pause between passes over a device.
    pub interval: u64,
    /// Nursery rows younger than this wait for a later pass.
    pub min_age: u64,
    /// Tombstones older than this are purged.
    pub reclaim_age: u64,
    pub cache_entries: usize,
    pub cache_max_age: u64,
    /// Drop a stable handoff copy without re-checking the primaries.
    pub handoff_trusts_ring: bool,
}

impl Default for StabilizeSection {
    fn default() -> Self {
        Self {
            interval: 30,
            min_age: 0,
            reclaim_age: 7 * 24 * 3600,
            cache_entries: 100_000,
            cache_max_age: 600,
            handoff_trusts_ring: true,
        }
    }
}

/// `[replication]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Priority replication jobs allowed per device at once.
    pub jobs_per_device: usize,
    /// Devices stabilized at once.
    pub concurrency: usize,
    /// Capacity of object streams.
    pub channel_capacity: usize,
    /// Timeout of a single peer request, in seconds.
    pub peer_timeout: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            jobs_per_device: 2,
            concurrency: 4,
            channel_capacity: 100,
            peer_timeout: 60,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, the default location, or defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(&p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// `stratad.toml` under the user's config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("strata").join("stratad.toml"))
    }

    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Storage strategy of the configured policy.
    pub fn strategy(&self) -> anyhow::Result<Strategy> {
        match self.policy.kind.as_str() {
            "replicated" => Ok(Strategy::Replicated),
            "erasure" => {
                let layout = ErasureLayout::new(
                    self.policy.data_shards,
                    self.policy.parity_shards,
                    self.policy.chunk_size,
                )?;
                Ok(Strategy::ErasureCoded {
                    layout,
                    nursery_replicas: self.policy.nursery_replicas,
                })
            }
            other => bail!("unknown policy kind {other:?}, expected \"replicated\" or \"erasure\""),
        }
    }

    /// Engine configuration for this server.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = EngineConfig::new(&self.node.devices);
        config.policy = self.policy.index;
        config.hash_path_prefix = self.ring.hash_path_prefix.clone();
        config.hash_path_suffix = self.ring.hash_path_suffix.clone();
        config.strategy = self.strategy()?;
        config.reclaim_age = Duration::from_secs(self.stabilize.reclaim_age);
        config.min_stabilize_age = Duration::from_secs(self.stabilize.min_age);
        config.cache_entries = self.stabilize.cache_entries;
        config.cache_max_age = Duration::from_secs(self.stabilize.cache_max_age);
        config.handoff_trusts_ring = self.stabilize.handoff_trusts_ring;
        config.channel_capacity = self.replication.channel_capacity;
        config.local_address = self.node.ip.clone().map(|ip| (ip, self.node.port));
        Ok(config)
    }

    pub fn stabilize_interval(&self) -> Duration {
        Duration::from_secs(self.stabilize.interval.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.peer_timeout.max(1))
    }
}
