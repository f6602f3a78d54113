//! The tenant configuration graph (spec §3, §4.F): the immutable [`Layout`]
//! a [`Tenant`] points at, its coordination-store-backed [`LayoutStore`],
//! and the fold from an already-parsed [`UnparsedTenantConfig`] into a
//! `Layout`. Parsing the underlying project YAML is out of scope — this
//! crate's input boundary stops at "loaded tenant descriptor".

pub mod build;
pub mod model;
pub mod store;

pub use build::{build_layout, ProjectSource, UnparsedTenantConfig};
pub use model::{
    JobSpecificity, JobVariant, Layout, LoadingError, ManagerKind, NodesetConfig, PipelineConfig,
    Precedence, ProjectConfig, ProjectMembership, ProjectTrust, ReportOutcome, ReporterConfig,
    SemaphoreConfig, Tenant, TriggerFilter,
};
pub use store::{BranchCacheMinLtimes, LayoutState, LayoutStore};
