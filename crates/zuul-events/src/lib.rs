//! The three event queues that feed the scheduler's main loop: trigger
//! events from source-control drivers, management commands from operators
//! and the REST/CLI surface, and result events reported back by executors
//! and mergers (spec §4.B). Each is a thin, typed layer over sequential
//! nodes in the coordination store — enqueue creates a node, poll lists and
//! parses children, ack deletes by path+version.

pub mod management;
pub mod queue;

pub use management::ManagementEventQueue;
pub use queue::{EventQueue, ResultEventQueue, TriggerEventQueue};
