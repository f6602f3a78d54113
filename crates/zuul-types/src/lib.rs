//! # zuul-types
//!
//! Core domain vocabulary shared by every crate in the scheduler: identifiers,
//! the event envelope, node/semaphore/component records, and the result
//! taxonomy a [`Build`](crate::build::BuildResult) can settle into.
//!
//! Nothing in this crate talks to the coordination store directly — it only
//! defines the shapes that get serialized into it. That keeps it a leaf
//! dependency: every other crate in the workspace depends on `zuul-types`,
//! it depends on nothing workspace-local.

pub mod ack;
pub mod build;
pub mod component;
pub mod event;
pub mod ids;
pub mod node;
pub mod semaphore;

pub use ack::AckRef;
pub use build::{Build, BuildResult};
pub use component::{ComponentKind, ComponentRegistration, ComponentState};
pub use event::{Event, ManagementEvent, ResultEvent, TriggerEvent};
pub use ids::{BuildId, BuildSetId, ItemId, LayoutId, TenantName};
pub use node::{HoldRequest, Node, NodeRequest, NodeRequestState, NodeState};
pub use semaphore::{Semaphore, SemaphoreHandle};
