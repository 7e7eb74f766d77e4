//! Reed-Solomon erasure encoder.
//!
//! Splits a chunk into `k` data shards and generates `m` parity shards.

use bytes::Bytes;
use tracing::trace;

use crate::error::ErasureError;

/// One piece of an encoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Position in the RS coding scheme (0..k for data, k..k+m for parity).
    pub index: u8,
    /// The raw shard data.
    pub data: Bytes,
}

/// Reed-Solomon erasure encoder.
///
/// All shards of a chunk are the same size. If the chunk isn't evenly
/// divisible by `k`, it is padded with zeros. Shard sizes are also padded
/// to be even (required by `reed-solomon-simd`).
#[derive(Debug, Clone, Copy)]
pub struct ErasureEncoder {
    k: usize,
    m: usize,
}

impl ErasureEncoder {
    /// Create a new encoder with the given data/parity shard counts.
    pub fn new(k: usize, m: usize) -> Self {
        Self { k, m }
    }

    /// Size of every shard produced for a chunk of `chunk_len` bytes.
    pub fn shard_size(&self, chunk_len: usize) -> usize {
        round_up_even(chunk_len.div_ceil(self.k))
    }

    /// Encode a chunk into `k + m` shards, data shards first.
    pub fn encode(&self, chunk: &[u8]) -> Result<Vec<Shard>, ErasureError> {
        if chunk.is_empty() {
            return Err(ErasureError::EmptyChunk);
        }

        let shard_size = self.shard_size(chunk.len());

        let padded_len = self.k * shard_size;
        let mut padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(chunk);
        padded.resize(padded_len, 0);

        let originals: Vec<&[u8]> = padded.chunks_exact(shard_size).collect();
        debug_assert_eq!(originals.len(), self.k);

        let recovery = reed_solomon_simd::encode(self.k, self.m, &originals)?;

        let mut shards = Vec::with_capacity(self.k + self.m);
        for (i, original) in originals.iter().enumerate() {
            shards.push(Shard {
                index: i as u8,
                data: Bytes::copy_from_slice(original),
            });
        }
        for (i, rec) in recovery.iter().enumerate() {
            shards.push(Shard {
                index: (self.k + i) as u8,
                data: Bytes::copy_from_slice(rec),
            });
        }

        trace!(
            k = self.k,
            m = self.m,
            chunk_len = chunk.len(),
            shard_size,
            "encoded chunk into shards"
        );

        Ok(shards)
    }
}

/// Round up to the nearest even number.
pub(crate) fn round_up_even(n: usize) -> usize {
    if n.is_multiple_of(2) { n } else { n + 1 }
}
