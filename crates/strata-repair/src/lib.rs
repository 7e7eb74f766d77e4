//! Priority replication for Strata.
//!
//! - [`get_part_move_jobs`] plans the moves caused by a ring change.
//! - [`get_restore_device_jobs`] plans the refill of a replaced device.
//! - [`DevLimiter`] caps concurrent jobs per device.
//! - [`PriorityRepRunner`] sends jobs to their source servers.

pub mod error;
pub mod limiter;
pub mod planner;
pub mod runner;

pub use error::RepairError;
pub use limiter::DevLimiter;
pub use planner::{get_part_move_jobs, get_restore_device_jobs};
pub use runner::{PriorityRepRunner, RunReport, dispatch};
