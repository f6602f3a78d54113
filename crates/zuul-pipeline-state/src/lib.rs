//! The coordination-store-backed tree of [`ChangeQueue`]s, [`QueueItem`]s,
//! [`BuildSet`]s, and `Build`s for one pipeline (spec §4.G).
//!
//! This crate owns only persistence and the invariants that live purely in
//! the data ([`BuildSet::is_launchable`], window math). Deciding *when* to
//! add, reparent, or remove an item belongs to the Pipeline Manager; this
//! crate just makes sure the manager's decisions survive a scheduler
//! restart.

pub mod model;
pub mod store;

pub use model::{
    BuildSet, ChangeQueue, MergeState, PipelineSummary, QueueItem, ReportingState,
};
pub use store::PipelineStateStore;
