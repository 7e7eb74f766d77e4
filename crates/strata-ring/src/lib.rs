//! Partition ring for Strata.
//!
//! The ring maps every ring partition (the top `part_power` bits of an
//! [`ObjectHash`](strata_types::ObjectHash)) to an ordered list of primary
//! devices, and enumerates handoff devices used when a primary is down.
//!
//! The storage engine only consumes the [`Ring`] trait. [`StaticRing`] is
//! the concrete table loaded from a JSON ring file, and [`RingBuilder`]
//! produces one deterministically from a device list using a weighted
//! virtual-node walk.

mod builder;
mod error;
mod ring;

pub use builder::RingBuilder;
pub use error::RingError;
pub use ring::{Ring, StaticRing};
