//! Seam to the source-system mergeability check (spec §1: code review state,
//! required votes, and branch protection all live in the external source
//! system). `add_change`'s readiness gate (spec §4.H step 2) asks this trait,
//! not the change itself, whether a change may be enqueued.

use std::collections::HashSet;
use std::sync::Mutex;

pub trait MergeabilityOracle: Send + Sync {
    fn is_mergeable(&self, change: &str) -> bool;
}

/// Every change is mergeable — the default for pipelines (like `check`) that
/// don't gate on review state.
pub struct AlwaysMergeable;

impl MergeabilityOracle for AlwaysMergeable {
    fn is_mergeable(&self, _change: &str) -> bool {
        true
    }
}

/// Everything is mergeable except a denylist, set at construction or toggled
/// at runtime — the test double used to exercise the "not yet ready" path of
/// `add_change` without a real source-system connector.
#[derive(Default)]
pub struct DenyList {
    denied: Mutex<HashSet<String>>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, change: impl Into<String>) {
        self.denied.lock().unwrap().insert(change.into());
    }

    pub fn allow(&self, change: &str) {
        self.denied.lock().unwrap().remove(change);
    }
}

impl MergeabilityOracle for DenyList {
    fn is_mergeable(&self, change: &str) -> bool {
        !self.denied.lock().unwrap().contains(change)
    }
}
