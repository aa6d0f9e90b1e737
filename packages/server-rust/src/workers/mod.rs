//! Background workers.
//!
//! Two independent flows of control run alongside the request path:
//!
//! - [`monitor::MonitorWorker`]: periodic integrity sweeps on a duty cycle
//! - [`cacher::CacherWorker`]: drains the persistent cache-request queue
//!
//! Both receive narrow capabilities (integrity monitors, the [`Placement`]
//! interface) rather than the cache manager itself, and both honor
//! interrupts cooperatively at their next cycle or item boundary.
//!
//! [`Placement`]: crate::manager::Placement

pub mod cacher;
pub mod monitor;

pub use cacher::{CacheQueue, CacherWorker, QueueEntry, QueueError};
pub use monitor::{
    read_status, MonitorError, MonitorState, MonitorStatus, MonitorWorker,
};
