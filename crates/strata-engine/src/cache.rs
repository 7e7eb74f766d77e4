//! Bounded LRU of objects being stabilized.
//!
//! Keys are `"{device}-{hash}-{metahash}"`. A `true` value means the object
//! was handed to a stabilizer and has not been confirmed stable; `false`
//! means some node already finished stabilizing this exact version, so
//! other passes and notifications can skip it. Losing an entry only costs
//! redundant work.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use strata_types::ObjectHash;
use tracing::debug;

/// Thread-safe dedup cache for the stabilization pipeline.
///
/// Every operation is a constant-time map update under one short lock.
pub struct StabilizeCache {
    max_age: Duration,
    /// `None` when the cache is disabled.
    inner: Option<Mutex<LruCache<String, Entry>>>,
}

#[derive(Clone, Copy)]
struct Entry {
    pending: bool,
    inserted: Instant,
}

fn cache_key(device: &str, hash: &ObjectHash, metahash: &str) -> String {
    format!("{device}-{hash}-{metahash}")
}

/// Look up and promote a live entry, dropping it once expired.
fn live(lru: &mut LruCache<String, Entry>, key: &str, max_age: Duration) -> Option<Entry> {
    let entry = *lru.get(key)?;
    if entry.inserted.elapsed() > max_age {
        lru.pop(key);
        return None;
    }
    Some(entry)
}

fn insert(lru: &mut LruCache<String, Entry>, key: String, pending: bool) {
    let entry = Entry {
        pending,
        inserted: Instant::now(),
    };
    if let Some((evicted, _)) = lru.push(key.clone(), entry)
        && evicted != key
    {
        debug!(key = %evicted, "evicted stabilize cache entry");
    }
}

impl StabilizeCache {
    /// A `max_entries` of 0 disables the cache.
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            max_age,
            inner: NonZeroUsize::new(max_entries).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn lock(&self) -> Option<std::sync::MutexGuard<'_, LruCache<String, Entry>>> {
        self.inner
            .as_ref()
            .map(|m| m.lock().expect("stabilize cache lock poisoned"))
    }

    /// Record objects handed to a stabilizer pass. Existing entries keep
    /// their state.
    pub fn mark_being_stabilized<'a>(
        &self,
        device: &str,
        items: impl IntoIterator<Item = (&'a ObjectHash, &'a str)>,
    ) {
        let Some(mut lru) = self.lock() else {
            return;
        };
        for (hash, metahash) in items {
            let key = cache_key(device, hash, metahash);
            if live(&mut lru, &key, self.max_age).is_none() {
                insert(&mut lru, key, true);
            }
        }
    }

    /// Record the outcome of a stabilization attempt.
    ///
    /// Returns `false` when this version is already known to be stable,
    /// in which case nothing changes.
    pub fn update_item_stabilized(
        &self,
        device: &str,
        hash: &ObjectHash,
        metahash: &str,
        stabilized: bool,
    ) -> bool {
        let Some(mut lru) = self.lock() else {
            return true;
        };
        let key = cache_key(device, hash, metahash);
        if let Some(entry) = live(&mut lru, &key, self.max_age)
            && !entry.pending
        {
            return false;
        }
        insert(&mut lru, key, !stabilized);
        true
    }

    /// Whether this version is known to be stable already.
    pub fn is_stabilized(&self, device: &str, hash: &ObjectHash, metahash: &str) -> bool {
        let Some(mut lru) = self.lock() else {
            return false;
        };
        let key = cache_key(device, hash, metahash);
        live(&mut lru, &key, self.max_age).is_some_and(|entry| !entry.pending)
    }

    /// Drop the entry for one version.
    pub fn reset(&self, device: &str, hash: &ObjectHash, metahash: &str) {
        if let Some(mut lru) = self.lock() {
            lru.pop(&cache_key(device, hash, metahash));
        }
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |lru| lru.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
