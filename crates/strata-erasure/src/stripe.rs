//! Chunked striping of whole objects.
//!
//! An object is cut into `chunk_size` chunks; every chunk is encoded
//! independently and shard `i` of the object is the concatenation of shard
//! `i` of each chunk. The last chunk may be short, so its pieces are
//! smaller than the others.

use tracing::debug;

use crate::decoder::decode;
use crate::encoder::{ErasureEncoder, round_up_even};
use crate::error::ErasureError;

/// Shard counts and chunk size of an erasure-coded policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasureLayout {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub chunk_size: usize,
}

impl ErasureLayout {
    /// Validate and build a layout.
    pub fn new(
        data_shards: usize,
        parity_shards: usize,
        chunk_size: usize,
    ) -> Result<Self, ErasureError> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(ErasureError::InvalidLayout(format!(
                "need at least one data and one parity shard, got {data_shards}+{parity_shards}"
            )));
        }
        if data_shards + parity_shards > usize::from(u8::MAX) {
            return Err(ErasureError::InvalidLayout(format!(
                "{} shards exceed the maximum of {}",
                data_shards + parity_shards,
                u8::MAX
            )));
        }
        if chunk_size == 0 {
            return Err(ErasureError::InvalidLayout("chunk size must be positive".into()));
        }
        Ok(Self {
            data_shards,
            parity_shards,
            chunk_size,
        })
    }

    /// Total number of shards, `k + m`.
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    fn encoder(&self) -> ErasureEncoder {
        ErasureEncoder::new(self.data_shards, self.parity_shards)
    }

    /// Exact length of every shard of an object of `content_length` bytes.
    pub fn shard_length(&self, content_length: u64) -> u64 {
        let chunk = self.chunk_size as u64;
        let full_chunks = content_length / chunk;
        let remainder = content_length % chunk;
        let piece = |len: u64| round_up_even(len.div_ceil(self.data_shards as u64) as usize) as u64;

        let mut length = full_chunks * piece(chunk);
        if remainder > 0 {
            length += piece(remainder);
        }
        length
    }

    /// `(chunk_len, piece_len)` for every chunk of an object.
    fn chunks(&self, content_length: u64) -> Vec<(usize, usize)> {
        let encoder = self.encoder();
        let mut out = Vec::new();
        let mut remaining = content_length;
        while remaining > 0 {
            let len = remaining.min(self.chunk_size as u64) as usize;
            out.push((len, encoder.shard_size(len)));
            remaining -= len as u64;
        }
        out
    }

    /// Encode an object into `k + m` shard streams.
    pub fn encode_object(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        let encoder = self.encoder();
        let shard_len = self.shard_length(data.len() as u64) as usize;
        let mut streams: Vec<Vec<u8>> = (0..self.total_shards())
            .map(|_| Vec::with_capacity(shard_len))
            .collect();

        for chunk in data.chunks(self.chunk_size) {
            for shard in encoder.encode(chunk)? {
                streams[shard.index as usize].extend_from_slice(&shard.data);
            }
        }

        debug!(
            content_length = data.len(),
            shard_len,
            k = self.data_shards,
            m = self.parity_shards,
            "encoded object"
        );
        Ok(streams)
    }

    /// Decode an object from at least `k` complete shard streams.
    pub fn decode_object(
        &self,
        shards: &[(u8, Vec<u8>)],
        content_length: u64,
    ) -> Result<Vec<u8>, ErasureError> {
        self.check_streams(shards, content_length)?;

        let mut out = Vec::with_capacity(content_length as usize);
        let mut offset = 0usize;
        for (chunk_len, piece_len) in self.chunks(content_length) {
            let pieces: Vec<(u8, &[u8])> = shards
                .iter()
                .map(|(i, data)| (*i, &data[offset..offset + piece_len]))
                .collect();
            out.extend(decode(
                self.data_shards,
                self.parity_shards,
                &pieces,
                chunk_len,
            )?);
            offset += piece_len;
        }
        Ok(out)
    }

    /// Rebuild shard stream `index` from at least `k` surviving streams.
    pub fn reconstruct_shard(
        &self,
        shards: &[(u8, Vec<u8>)],
        content_length: u64,
        index: u8,
    ) -> Result<Vec<u8>, ErasureError> {
        if index as usize >= self.total_shards() {
            return Err(ErasureError::InvalidIndex {
                index: index as usize,
                total: self.total_shards(),
            });
        }
        self.check_streams(shards, content_length)?;

        let encoder = self.encoder();
        let mut out = Vec::with_capacity(self.shard_length(content_length) as usize);
        let mut offset = 0usize;
        for (chunk_len, piece_len) in self.chunks(content_length) {
            let pieces: Vec<(u8, &[u8])> = shards
                .iter()
                .map(|(i, data)| (*i, &data[offset..offset + piece_len]))
                .collect();
            let chunk = decode(self.data_shards, self.parity_shards, &pieces, chunk_len)?;
            let encoded = encoder.encode(&chunk)?;
            out.extend_from_slice(&encoded[index as usize].data);
            offset += piece_len;
        }

        debug!(index, content_length, "reconstructed shard");
        Ok(out)
    }

    fn check_streams(
        &self,
        shards: &[(u8, Vec<u8>)],
        content_length: u64,
    ) -> Result<(), ErasureError> {
        if shards.len() < self.data_shards {
            return Err(ErasureError::NotEnoughShards {
                needed: self.data_shards,
                got: shards.len(),
            });
        }
        let expected = self.shard_length(content_length);
        for (index, data) in shards {
            if data.len() as u64 != expected {
                return Err(ErasureError::ShardLength {
                    index: *index,
                    expected,
                    got: data.len() as u64,
                });
            }
        }
        Ok(())
    }
}
