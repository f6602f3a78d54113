//! The immutable configuration graph (spec §3): a [`Layout`] is the frozen
//! snapshot a [`Tenant`] points at. Once published, nothing in it mutates —
//! a reconfigure produces a whole new `Layout` with a new [`LayoutId`] and
//! swaps the pointer; nothing holds a `&mut Layout`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zuul_duration::WindowPolicy;
use zuul_types::LayoutId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerKind {
    Dependent,
    Independent,
    Serial,
    Supercedent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportOutcome {
    Start,
    Success,
    Failure,
    MergeFailure,
    NoJobs,
    Disabled,
    Dequeue,
    Enqueue,
}

/// Where a report for a given [`ReportOutcome`] goes. The concrete reporter
/// implementations (source-system comment, SMTP, ...) are external
/// collaborators (spec §1); this just names which one(s) apply per outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    pub outcome: ReportOutcome,
    pub reporter_names: Vec<String>,
}

/// A single filter a [`TriggerEvent`](zuul_types::TriggerEvent) must match
/// for this pipeline to consider the change (spec §4.H `eventMatches`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerFilter {
    pub trigger_name: String,
    pub ref_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub manager: ManagerKind,
    pub triggers: Vec<TriggerFilter>,
    pub reporters: Vec<ReporterConfig>,
    pub window: WindowPolicy,
    pub precedence: Precedence,
    /// Named queues this pipeline's changes can land in (dependent managers
    /// support more than one; independent/serial/supercedent derive their
    /// queue set dynamically and this is typically empty).
    pub queue_names: Vec<String>,
}

impl PipelineConfig {
    pub fn reporters_for(&self, outcome: ReportOutcome) -> impl Iterator<Item = &str> {
        self.reporters
            .iter()
            .filter(move |r| r.outcome == outcome)
            .flat_map(|r| r.reporter_names.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSpecificity {
    /// A job defined at the pipeline/project-template level, lowest priority.
    Base,
    /// A job variant scoped to a specific project.
    Project,
    /// A job variant scoped to a specific project + branch, highest priority.
    ProjectBranch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVariant {
    pub name: String,
    pub specificity: JobSpecificity,
    pub parent: Option<String>,
    pub nodeset: Option<String>,
    pub semaphores: Vec<String>,
    pub dependencies: Vec<String>,
    pub attempts: u32,
    #[serde(with = "zuul_duration::codec")]
    pub timeout: std::time::Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesetConfig {
    pub name: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemaphoreConfig {
    pub name: String,
    pub max_count: u32,
    pub resources_first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectTrust {
    Trusted,
    Untrusted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub trust: ProjectTrust,
    /// Jobs this project runs per pipeline name.
    pub pipeline_jobs: BTreeMap<String, Vec<String>>,
}

/// A configuration-syntax error accumulated on a [`Layout`] instead of
/// aborting the whole tenant reconfigure (spec §7 `ConfigurationSyntaxError`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadingError {
    pub source: String,
    pub message: String,
}

/// The frozen configuration snapshot a tenant points at (spec §3). Ordered
/// maps preserve the specificity/definition order the manager depends on
/// when resolving job variants and pipeline iteration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layout {
    pub id: LayoutId,
    pub pipelines: BTreeMap<String, PipelineConfig>,
    /// job name -> variants, ordered least to most specific (spec §3).
    pub jobs: BTreeMap<String, Vec<JobVariant>>,
    pub projects: BTreeMap<String, ProjectConfig>,
    pub semaphores: BTreeMap<String, SemaphoreConfig>,
    pub nodesets: BTreeMap<String, NodesetConfig>,
    pub loading_errors: Vec<LoadingError>,
}

impl Layout {
    pub fn new() -> Self {
        Self {
            id: LayoutId::new(),
            pipelines: BTreeMap::new(),
            jobs: BTreeMap::new(),
            projects: BTreeMap::new(),
            semaphores: BTreeMap::new(),
            nodesets: BTreeMap::new(),
            loading_errors: Vec::new(),
        }
    }

    /// Most-specific-first lookup: branch-scoped variant if present, else
    /// project-scoped, else the base variant (spec §3 "jobs ... ordered by
    /// specificity").
    pub fn resolve_job(&self, job_name: &str) -> Option<&JobVariant> {
        let variants = self.jobs.get(job_name)?;
        variants.iter().max_by_key(|v| v.specificity as u8)
    }

    pub fn has_load_errors(&self) -> bool {
        !self.loading_errors.is_empty()
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectMembership {
    Trusted,
    Untrusted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub name: zuul_types::TenantName,
    pub max_nodes_per_job: u32,
    #[serde(with = "zuul_duration::codec")]
    pub max_job_timeout: std::time::Duration,
    pub allowed_labels: Vec<String>,
    pub allowed_triggers: Vec<String>,
    pub allowed_reporters: Vec<String>,
    pub projects: BTreeMap<String, ProjectMembership>,
    pub layout: Layout,
}

impl Tenant {
    /// Structural diff against a previous layout for this tenant: which
    /// pipelines were added, removed, or changed shape — used to decide
    /// whether old queues need to be walked and reenqueued (spec §4.G).
    pub fn pipelines_changed_since(&self, previous: &Layout) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, pipeline) in &self.layout.pipelines {
            match previous.pipelines.get(name) {
                None => changed.push(name.clone()),
                Some(prev) if !pipeline_structurally_equal(pipeline, prev) => {
                    changed.push(name.clone())
                }
                Some(_) => {}
            }
        }
        for name in previous.pipelines.keys() {
            if !self.layout.pipelines.contains_key(name) {
                changed.push(name.clone());
            }
        }
        changed
    }
}

fn pipeline_structurally_equal(a: &PipelineConfig, b: &PipelineConfig) -> bool {
    a.manager == b.manager && a.queue_names == b.queue_names && a.window.initial == b.window.initial
}
