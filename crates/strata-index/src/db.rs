//! [`IndexDb`] implementation wrapping a Fjall keyspace.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use serde::{Deserialize, Serialize};
use strata_types::{IndexItem, Metadata, Method, ObjectHash, metahash, now_nanos};
use tracing::{debug, info, warn};

use crate::IndexError;
use crate::layout::DeviceLayout;
use crate::temp::TempFile;

type Result<T> = std::result::Result<T, IndexError>;

const KEY_LEN: usize = 18;

/// Tunables of one index database.
#[derive(Debug, Clone)]
pub struct IndexDbConfig {
    /// Ring partition power, for [`IndexDb::ring_part_range`].
    pub part_power: u32,
    /// Tombstones older than this are purged by [`IndexDb::expire_objects`].
    pub reclaim_age: Duration,
    /// Rows younger than this are not offered for stabilization.
    pub min_stabilize_age: Duration,
}

impl Default for IndexDbConfig {
    fn default() -> Self {
        Self {
            part_power: 10,
            reclaim_age: Duration::from_secs(7 * 24 * 3600),
            min_stabilize_age: Duration::ZERO,
        }
    }
}

/// Hash bounds of one ring partition. `end = None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub start: ObjectHash,
    pub end: Option<ObjectHash>,
}

impl HashRange {
    /// Whether `hash` falls in `[start, end)`.
    pub fn contains(&self, hash: &ObjectHash) -> bool {
        *hash >= self.start && self.end.is_none_or(|end| *hash < end)
    }
}

/// One mutation of a row.
#[derive(Debug)]
pub struct CommitRequest {
    /// New bytes; required for [`Method::Put`], ignored otherwise.
    pub temp: Option<TempFile>,
    pub hash: ObjectHash,
    pub shard: u16,
    pub timestamp: i64,
    pub method: Method,
    /// Full metadata for PUT/DELETE; keys to overwrite for POST.
    pub metadata: Metadata,
    pub nursery: bool,
    pub restabilize: bool,
}

/// Stored row value. The key carries hash and shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Row {
    timestamp: i64,
    nursery: bool,
    deletion: bool,
    restabilize: bool,
    metahash: String,
    metabytes: Vec<u8>,
    path: Option<String>,
}

/// Index of the objects stored on one device.
///
/// Readers go straight to Fjall. Writers serialize on a per-device mutex so
/// that each read-compare-write of a row is atomic; every mutation writes
/// exactly one key.
pub struct IndexDb {
    #[allow(dead_code)]
    db: Database,
    items: Keyspace,
    layout: DeviceLayout,
    config: IndexDbConfig,
    write_lock: Mutex<()>,
    _tmp: Option<tempfile::TempDir>,
}

impl IndexDb {
    /// Open (creating if needed) the index of `policy` on a device root.
    pub fn open(device_root: impl AsRef<Path>, policy: u32, config: IndexDbConfig) -> Result<Self> {
        let layout = DeviceLayout::new(device_root, policy);
        layout.create_all()?;
        let db = Database::builder(layout.index_dir()).open()?;
        info!(root = %layout.root().display(), policy, "opened index database");
        Self::init(db, layout, config, None)
    }

    /// Open an index on a temporary device root that is removed on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary(policy: u32, config: IndexDbConfig) -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let layout = DeviceLayout::new(tmp.path(), policy);
        layout.create_all()?;
        let db = Database::builder(layout.index_dir()).temporary(true).open()?;
        Self::init(db, layout, config, Some(tmp))
    }

    fn init(
        db: Database,
        layout: DeviceLayout,
        config: IndexDbConfig,
        tmp: Option<tempfile::TempDir>,
    ) -> Result<Self> {
        let items = db.keyspace("items", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            items,
            layout,
            config,
            write_lock: Mutex::new(()),
            _tmp: tmp,
        })
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    pub fn part_power(&self) -> u32 {
        self.config.part_power
    }

    // ----- Reads -----

    /// Row for `(hash, shard)`. Tombstones are hidden unless `include_deleted`.
    pub fn lookup(
        &self,
        hash: &ObjectHash,
        shard: u16,
        include_deleted: bool,
    ) -> Result<Option<IndexItem>> {
        let item = self.get_item(hash, shard)?;
        Ok(item.filter(|i| include_deleted || !i.deletion))
    }

    /// Newest row of any shard for `hash`.
    pub fn lookup_any(&self, hash: &ObjectHash, include_deleted: bool) -> Result<Option<IndexItem>> {
        let mut newest: Option<IndexItem> = None;
        for guard in self.items.prefix(hash.as_bytes()) {
            let (key, value) = guard.into_inner()?;
            let item = decode_item(&key, &value)?;
            if !include_deleted && item.deletion {
                continue;
            }
            if newest.as_ref().is_none_or(|n| item.timestamp > n.timestamp) {
                newest = Some(item);
            }
        }
        Ok(newest)
    }

    /// Deterministic data path of one object version.
    pub fn whole_object_path(
        &self,
        hash: &ObjectHash,
        shard: u16,
        timestamp: i64,
        nursery: bool,
    ) -> PathBuf {
        self.layout.object_path(hash, shard, timestamp, nursery)
    }

    /// Open a writer for new object bytes.
    pub fn temp_file(&self, hash: &ObjectHash, shard: u16, size: u64) -> Result<TempFile> {
        let temp = TempFile::new_in(&self.layout.tmp_dir(), size)?;
        debug!(%hash, shard, size, "opened temp file");
        Ok(temp)
    }

    /// Hash bounds of a ring partition.
    pub fn ring_part_range(&self, partition: u64) -> HashRange {
        part_range(partition, self.config.part_power)
    }

    /// Rows with keys in `[start, stop)`, strictly after `marker`, at most
    /// `limit` of them (`0` = unlimited). Includes tombstones.
    pub fn list(
        &self,
        start: ObjectHash,
        stop: Option<ObjectHash>,
        marker: Option<(ObjectHash, u16)>,
        limit: usize,
    ) -> Result<Vec<IndexItem>> {
        let start_key = item_key(&start, 0);
        let lower = match marker {
            Some((hash, shard)) if item_key(&hash, shard) >= start_key => {
                Bound::Excluded(item_key(&hash, shard).to_vec())
            }
            _ => Bound::Included(start_key.to_vec()),
        };
        let upper = match stop {
            Some(stop) => Bound::Excluded(item_key(&stop, 0).to_vec()),
            None => Bound::Unbounded,
        };

        let mut items = Vec::new();
        for guard in self.items.range((lower, upper)) {
            let (key, value) = guard.into_inner()?;
            items.push(decode_item(&key, &value)?);
            if limit > 0 && items.len() == limit {
                break;
            }
        }
        Ok(items)
    }

    /// Every row of a ring partition, in key order.
    pub fn list_partition(&self, partition: u64) -> Result<Vec<IndexItem>> {
        let range = self.ring_part_range(partition);
        self.list(range.start, range.end, None, 0)
    }

    /// Rows in the nursery or flagged for restabilization that are older
    /// than the configured minimum age.
    pub fn list_objects_to_stabilize(&self) -> Result<Vec<IndexItem>> {
        let cutoff = now_nanos().saturating_sub(duration_nanos(self.config.min_stabilize_age));
        let mut items = Vec::new();
        for guard in self.items.iter() {
            let (key, value) = guard.into_inner()?;
            let item = decode_item(&key, &value)?;
            if (item.nursery || item.restabilize) && item.timestamp <= cutoff {
                items.push(item);
            }
        }
        Ok(items)
    }

    // ----- Mutations -----

    /// Apply a PUT, DELETE or POST to one row.
    ///
    /// Rejected with [`IndexError::Conflict`] without any mutation when the
    /// stored row's timestamp is at least `req.timestamp`.
    pub fn commit(&self, req: CommitRequest) -> Result<()> {
        let CommitRequest {
            temp,
            hash,
            shard,
            timestamp,
            method,
            metadata,
            nursery,
            restabilize,
        } = req;

        let _guard = self.write_lock.lock().expect("index write lock poisoned");

        let existing = self.get_row(&hash, shard)?;
        if let Some(row) = &existing
            && row.timestamp >= timestamp
        {
            return Err(IndexError::Conflict {
                hash,
                shard,
                stored: row.timestamp,
                incoming: timestamp,
            });
        }

        let row = match method {
            Method::Put => {
                let temp = temp.ok_or_else(|| {
                    IndexError::Validation(format!("PUT of {hash}/{shard} without data"))
                })?;
                let path = self.layout.object_path(&hash, shard, timestamp, nursery);
                temp.persist(&path)?;
                let metabytes = serde_json::to_vec(&metadata)?;
                Row {
                    timestamp,
                    nursery,
                    deletion: false,
                    restabilize,
                    metahash: metahash(&metabytes),
                    metabytes,
                    path: Some(path.to_string_lossy().into_owned()),
                }
            }
            Method::Delete => {
                let metabytes = serde_json::to_vec(&metadata)?;
                Row {
                    timestamp,
                    nursery,
                    deletion: true,
                    restabilize,
                    metahash: metahash(&metabytes),
                    metabytes,
                    path: None,
                }
            }
            Method::Post => {
                let Some(current) = existing.as_ref().filter(|r| !r.deletion) else {
                    return Err(IndexError::NotFound { hash, shard });
                };
                let mut merged: Metadata = serde_json::from_slice(&current.metabytes)?;
                merged.extend(metadata);
                let metabytes = serde_json::to_vec(&merged)?;
                Row {
                    timestamp,
                    nursery,
                    deletion: false,
                    restabilize,
                    metahash: metahash(&metabytes),
                    metabytes,
                    path: current.path.clone(),
                }
            }
        };

        self.put_row(&hash, shard, &row)?;

        if method != Method::Post
            && let Some(old_path) = existing.and_then(|r| r.path)
            && row.path.as_deref() != Some(old_path.as_str())
        {
            remove_file_if_exists(Path::new(&old_path))?;
        }

        debug!(%hash, shard, timestamp, %method, nursery, "committed");
        Ok(())
    }

    /// Remove a row only if it still has the given timestamp, tier and
    /// metahash. Returns the number of rows removed.
    pub fn remove(
        &self,
        hash: &ObjectHash,
        shard: u16,
        timestamp: i64,
        nursery: bool,
        metahash: &str,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().expect("index write lock poisoned");

        let Some(row) = self.get_row(hash, shard)? else {
            return Ok(0);
        };
        if row.timestamp != timestamp || row.nursery != nursery || row.metahash != metahash {
            debug!(%hash, shard, timestamp, "remove skipped: row changed");
            return Ok(0);
        }

        self.items.remove(item_key(hash, shard).as_slice())?;
        if let Some(path) = row.path {
            remove_file_if_exists(Path::new(&path))?;
        }
        debug!(%hash, shard, timestamp, nursery, "removed row");
        Ok(1)
    }

    /// Promote a row observed at `(timestamp, nursery)` to the stable tier
    /// and clear its restabilize flag. Returns whether a row changed.
    pub fn set_stabilized(
        &self,
        hash: &ObjectHash,
        shard: u16,
        timestamp: i64,
        nursery: bool,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().expect("index write lock poisoned");

        let Some(mut row) = self.get_row(hash, shard)? else {
            return Ok(false);
        };
        if row.timestamp != timestamp || row.nursery != nursery {
            return Ok(false);
        }
        if !row.nursery && !row.restabilize {
            return Ok(false);
        }

        if row.nursery
            && let Some(path) = row.path.as_deref()
        {
            let stable = self.layout.object_path(hash, shard, timestamp, false);
            if Path::new(path) != stable {
                if let Some(parent) = stable.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(path, &stable)?;
                row.path = Some(stable.to_string_lossy().into_owned());
            }
        }
        row.nursery = false;
        row.restabilize = false;
        self.put_row(hash, shard, &row)?;

        debug!(%hash, shard, timestamp, "stabilized");
        Ok(true)
    }

    /// Purge tombstones older than the reclaim age. Returns the count.
    pub fn expire_objects(&self) -> Result<usize> {
        let cutoff = now_nanos().saturating_sub(duration_nanos(self.config.reclaim_age));

        let mut expired = Vec::new();
        for guard in self.items.iter() {
            let (key, value) = guard.into_inner()?;
            let row: Row = postcard::from_bytes(&value)?;
            if row.deletion && row.timestamp < cutoff {
                expired.push((key.to_vec(), row.timestamp));
            }
        }

        let _guard = self.write_lock.lock().expect("index write lock poisoned");
        let mut count = 0;
        for (key, timestamp) in expired {
            // Re-check under the lock: a newer write may have replaced the tombstone.
            match self.items.get(&key)? {
                Some(value) => {
                    let row: Row = postcard::from_bytes(&value)?;
                    if !row.deletion || row.timestamp != timestamp {
                        continue;
                    }
                }
                None => continue,
            }
            self.items.remove(key.as_slice())?;
            count += 1;
        }

        if count > 0 {
            info!(root = %self.layout.root().display(), count, "expired tombstones");
        }
        Ok(count)
    }

    /// Move an item's data file to quarantine and drop its row.
    pub fn quarantine(&self, item: &IndexItem) -> Result<()> {
        let _guard = self.write_lock.lock().expect("index write lock poisoned");

        if let Some(path) = &item.path {
            let dest =
                self.layout
                    .quarantine_path(&item.hash, item.shard, item.timestamp, item.nursery);
            std::fs::create_dir_all(self.layout.quarantine_dir())?;
            match std::fs::rename(path, &dest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(row) = self.get_row(&item.hash, item.shard)?
            && row.timestamp == item.timestamp
        {
            self.items.remove(item_key(&item.hash, item.shard).as_slice())?;
        }

        warn!(hash = %item.hash, shard = item.shard, timestamp = item.timestamp, "quarantined object");
        Ok(())
    }

    // ----- Row helpers -----

    fn get_row(&self, hash: &ObjectHash, shard: u16) -> Result<Option<Row>> {
        match self.items.get(item_key(hash, shard))? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_item(&self, hash: &ObjectHash, shard: u16) -> Result<Option<IndexItem>> {
        Ok(self
            .get_row(hash, shard)?
            .map(|row| row_to_item(*hash, shard, row)))
    }

    fn put_row(&self, hash: &ObjectHash, shard: u16, row: &Row) -> Result<()> {
        let value = postcard::to_allocvec(row)?;
        self.items.insert(item_key(hash, shard).as_slice(), value.as_slice())?;
        Ok(())
    }
}

/// `[start, end)` bounds of a partition: its top `part_power` hash bits.
fn part_range(partition: u64, part_power: u32) -> HashRange {
    if part_power == 0 {
        return HashRange {
            start: ObjectHash::MIN,
            end: None,
        };
    }
    let shift = 128 - part_power;
    let start = ObjectHash::from_u128(u128::from(partition) << shift);
    let next = partition + 1;
    let end = if next >= 1u64 << part_power {
        None
    } else {
        Some(ObjectHash::from_u128(u128::from(next) << shift))
    };
    HashRange { start, end }
}

fn item_key(hash: &ObjectHash, shard: u16) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..16].copy_from_slice(hash.as_bytes());
    key[16..].copy_from_slice(&shard.to_be_bytes());
    key
}

fn decode_item(key: &[u8], value: &[u8]) -> Result<IndexItem> {
    if key.len() != KEY_LEN {
        return Err(IndexError::Validation(format!(
            "corrupt index key of {} bytes",
            key.len()
        )));
    }
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&key[..16]);
    let shard = u16::from_be_bytes([key[16], key[17]]);
    let row: Row = postcard::from_bytes(value)?;
    Ok(row_to_item(ObjectHash::from(hash), shard, row))
}

fn row_to_item(hash: ObjectHash, shard: u16, row: Row) -> IndexItem {
    IndexItem {
        hash,
        shard,
        timestamp: row.timestamp,
        nursery: row.nursery,
        deletion: row.deletion,
        metahash: row.metahash,
        metabytes: row.metabytes,
        path: row.path.map(PathBuf::from),
        restabilize: row.restabilize,
    }
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
