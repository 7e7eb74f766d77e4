//! Directory layout of one device.

use std::path::{Path, PathBuf};

use strata_types::ObjectHash;

/// Paths of one device for one storage policy.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    root: PathBuf,
    policy: u32,
}

impl DeviceLayout {
    pub fn new(root: impl AsRef<Path>, policy: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> u32 {
        self.policy
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join(format!("objects-{}", self.policy))
    }

    pub fn index_dir(&self) -> PathBuf {
        self.objects_dir().join("index")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.objects_dir().join("data")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root
            .join("quarantined")
            .join(format!("objects-{}", self.policy))
    }

    /// Create every directory of the layout.
    pub fn create_all(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.index_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        std::fs::create_dir_all(self.quarantine_dir())?;
        Ok(())
    }

    /// Data file of one object version: 2-level fan-out on the hash.
    pub fn object_path(&self, hash: &ObjectHash, shard: u16, timestamp: i64, nursery: bool) -> PathBuf {
        let hex = hash.to_string();
        self.data_dir()
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(file_name(&hex, shard, timestamp, nursery))
    }

    /// Where a corrupt data file is moved.
    pub fn quarantine_path(
        &self,
        hash: &ObjectHash,
        shard: u16,
        timestamp: i64,
        nursery: bool,
    ) -> PathBuf {
        let hex = hash.to_string();
        self.quarantine_dir()
            .join(file_name(&hex, shard, timestamp, nursery))
    }
}

fn file_name(hex: &str, shard: u16, timestamp: i64, nursery: bool) -> String {
    let tier = if nursery { 'n' } else { 's' };
    format!("{hex}.{shard}.{timestamp}.{tier}")
}
