//! Reed-Solomon erasure decoder.

use tracing::trace;

use crate::error::ErasureError;

/// Decode one chunk from a subset of its shards.
///
/// `shards` holds at least `k` `(index, data)` pairs of equal length, where
/// index is 0..k for data shards and k..k+m for parity shards.
/// `original_size` is the unpadded chunk size in bytes.
pub fn decode(
    k: usize,
    m: usize,
    shards: &[(u8, &[u8])],
    original_size: usize,
) -> Result<Vec<u8>, ErasureError> {
    if shards.len() < k {
        return Err(ErasureError::NotEnoughShards {
            needed: k,
            got: shards.len(),
        });
    }

    let mut originals: Vec<(usize, &[u8])> = Vec::new();
    let mut recovery: Vec<(usize, &[u8])> = Vec::new();
    for &(index, data) in shards {
        let idx = index as usize;
        if idx >= k + m {
            return Err(ErasureError::InvalidIndex {
                index: idx,
                total: k + m,
            });
        }
        if idx < k {
            if !originals.iter().any(|(i, _)| *i == idx) {
                originals.push((idx, data));
            }
        } else if !recovery.iter().any(|(i, _)| *i == idx - k) {
            recovery.push((idx - k, data));
        }
    }

    trace!(
        k,
        m,
        originals = originals.len(),
        recovery = recovery.len(),
        original_size,
        "decoding chunk from shards"
    );

    let shard_size = shards[0].1.len();
    let mut result = vec![0u8; k * shard_size];
    for (idx, data) in &originals {
        let start = idx * shard_size;
        result[start..start + shard_size].copy_from_slice(data);
    }

    // All data shards present: no RS decode needed.
    if originals.len() < k {
        if originals.len() + recovery.len() < k {
            return Err(ErasureError::NotEnoughShards {
                needed: k,
                got: originals.len() + recovery.len(),
            });
        }
        let restored = reed_solomon_simd::decode(k, m, originals, recovery)?;
        for (idx, data) in &restored {
            let start = idx * shard_size;
            result[start..start + shard_size].copy_from_slice(data);
        }
    }

    result.truncate(original_size);
    Ok(result)
}
