//! The coordination-store client: the one seam between the scheduler
//! process and the shared state every scheduler, executor, and merger reads
//! and writes through (spec §4.A). Everything above this crate treats the
//! store as the system of record; in-memory state elsewhere in the
//! workspace is a cache keyed by path.

pub mod client;
pub mod error;
pub mod lock;
pub mod memory;
pub mod sharded;
pub mod stat;

pub use client::CoordinationClient;
pub use error::ZkError;
pub use lock::LockHandle;
pub use memory::MemoryCoordinationClient;
pub use stat::{NodeStat, SessionId, WatchEvent, WatchEventKind};
