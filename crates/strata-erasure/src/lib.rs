//! Reed-Solomon erasure coding for Strata objects.
//!
//! This crate provides:
//! - [`ErasureEncoder`] splits one chunk into `k` data shards and `m` parity shards.
//! - [`decode`] reconstructs a chunk from any `k` of the `k + m` shards.
//! - [`ErasureLayout`] stripes a whole object chunk by chunk, so shard `i`
//!   of an object is the concatenation of shard `i` of every chunk, and
//!   computes the exact on-disk [`shard_length`](ErasureLayout::shard_length)
//!   used by integrity checks.
//!
//! Padding is handled automatically to satisfy `reed-solomon-simd`'s
//! even-size requirement.

mod decoder;
mod encoder;
mod error;
mod stripe;

pub use decoder::decode;
pub use encoder::{ErasureEncoder, Shard};
pub use error::ErasureError;
pub use stripe::ErasureLayout;
