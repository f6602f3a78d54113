//! Turns an already-parsed [`UnparsedTenantConfig`] into a frozen [`Layout`].
//! Parsing the underlying project YAML (the job/pipeline DSL) is out of
//! scope (spec §1); this module's input is the generic JSON shape that
//! parsing step would have produced, one chunk per project source.

use serde::{Deserialize, Serialize};

use crate::model::{Layout, LoadingError, NodesetConfig, PipelineConfig, ProjectConfig, SemaphoreConfig};

/// One project's already-parsed configuration declarations, as they'd arrive
/// from the external YAML loader (spec §1, §10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSource {
    pub project: String,
    pub branch: String,
    pub pipelines: Vec<PipelineConfig>,
    pub jobs: serde_json::Value,
    pub semaphores: Vec<SemaphoreConfig>,
    pub nodesets: Vec<NodesetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnparsedTenantConfig {
    pub sources: Vec<ProjectSource>,
}

/// Folds every [`ProjectSource`] into a new [`Layout`]. A malformed source
/// (here: a pipeline redeclared with a different manager kind, which the
/// real DSL would reject at a lower layer) doesn't abort the whole tenant —
/// it's recorded in `loading_errors` and the rest of the layout still
/// builds (spec §7 `ConfigurationSyntaxError`).
pub fn build_layout(config: &UnparsedTenantConfig) -> Layout {
    let mut layout = Layout::new();

    for source in &config.sources {
        for pipeline in &source.pipelines {
            match layout.pipelines.get(&pipeline.name) {
                Some(existing) if existing.manager != pipeline.manager => {
                    layout.loading_errors.push(LoadingError {
                        source: source.project.clone(),
                        message: format!(
                            "pipeline '{}' redeclared with a different manager ({:?} vs {:?})",
                            pipeline.name, existing.manager, pipeline.manager
                        ),
                    });
                    continue;
                }
                _ => {
                    layout
                        .pipelines
                        .insert(pipeline.name.clone(), pipeline.clone());
                }
            }
        }

        for semaphore in &source.semaphores {
            if semaphore.max_count == 0 {
                layout.loading_errors.push(LoadingError {
                    source: source.project.clone(),
                    message: format!("semaphore '{}' has max-count 0", semaphore.name),
                });
                continue;
            }
            layout
                .semaphores
                .insert(semaphore.name.clone(), semaphore.clone());
        }

        for nodeset in &source.nodesets {
            layout.nodesets.insert(nodeset.name.clone(), nodeset.clone());
        }

        layout
            .projects
            .entry(source.project.clone())
            .or_insert_with(|| ProjectConfig {
                name: source.project.clone(),
                trust: crate::model::ProjectTrust::Untrusted,
                pipeline_jobs: Default::default(),
            });

        match serde_json::from_value::<Vec<crate::model::JobVariant>>(source.jobs.clone()) {
            Ok(variants) => {
                for variant in variants {
                    layout.jobs.entry(variant.name.clone()).or_default().push(variant);
                }
            }
            Err(e) => layout.loading_errors.push(LoadingError {
                source: source.project.clone(),
                message: format!("could not parse job declarations: {e}"),
            }),
        }
    }

    for variants in layout.jobs.values_mut() {
        variants.sort_by_key(|v| v.specificity as u8);
    }

    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobSpecificity, ManagerKind, Precedence};
    use zuul_duration::{WindowGrowthType, WindowPolicy};

    fn window() -> WindowPolicy {
        WindowPolicy {
            initial: 20,
            floor: 3,
            increase_type: WindowGrowthType::Linear,
            increase_factor: 5,
            decrease_type: WindowGrowthType::Exponential,
            decrease_factor: 2,
        }
    }

    fn job_json(name: &str) -> serde_json::Value {
        serde_json::json!([{
            "name": name,
            "specificity": "base",
            "parent": null,
            "nodeset": "ubuntu-jammy",
            "semaphores": [],
            "dependencies": [],
            "attempts": 3,
            "timeout": "30m",
        }])
    }

    #[test]
    fn builds_a_layout_from_two_project_sources() {
        let config = UnparsedTenantConfig {
            sources: vec![
                ProjectSource {
                    project: "org/repo-a".into(),
                    branch: "main".into(),
                    pipelines: vec![PipelineConfig {
                        name: "gate".into(),
                        manager: ManagerKind::Dependent,
                        triggers: vec![],
                        reporters: vec![],
                        window: window(),
                        precedence: Precedence::Normal,
                        queue_names: vec!["integrated".into()],
                    }],
                    jobs: job_json("unit-tests"),
                    semaphores: vec![],
                    nodesets: vec![],
                },
                ProjectSource {
                    project: "org/repo-b".into(),
                    branch: "main".into(),
                    pipelines: vec![],
                    jobs: job_json("lint"),
                    semaphores: vec![SemaphoreConfig {
                        name: "db".into(),
                        max_count: 1,
                        resources_first: false,
                    }],
                    nodesets: vec![],
                },
            ],
        };

        let layout = build_layout(&config);
        assert!(layout.loading_errors.is_empty());
        assert_eq!(layout.pipelines.len(), 1);
        assert_eq!(layout.jobs.len(), 2);
        assert_eq!(layout.semaphores.len(), 1);
        assert_eq!(layout.projects.len(), 2);
        let _ = JobSpecificity::Base;
    }

    #[test]
    fn conflicting_pipeline_redeclaration_is_a_loading_error_not_a_panic() {
        let config = UnparsedTenantConfig {
            sources: vec![
                ProjectSource {
                    project: "org/repo-a".into(),
                    branch: "main".into(),
                    pipelines: vec![PipelineConfig {
                        name: "gate".into(),
                        manager: ManagerKind::Dependent,
                        triggers: vec![],
                        reporters: vec![],
                        window: window(),
                        precedence: Precedence::Normal,
                        queue_names: vec![],
                    }],
                    jobs: serde_json::json!([]),
                    semaphores: vec![],
                    nodesets: vec![],
                },
                ProjectSource {
                    project: "org/repo-b".into(),
                    branch: "main".into(),
                    pipelines: vec![PipelineConfig {
                        name: "gate".into(),
                        manager: ManagerKind::Serial,
                        triggers: vec![],
                        reporters: vec![],
                        window: window(),
                        precedence: Precedence::Normal,
                        queue_names: vec![],
                    }],
                    jobs: serde_json::json!([]),
                    semaphores: vec![],
                    nodesets: vec![],
                },
            ],
        };

        let layout = build_layout(&config);
        assert_eq!(layout.loading_errors.len(), 1);
        assert_eq!(layout.pipelines["gate"].manager, ManagerKind::Dependent);
    }

    #[test]
    fn zero_max_count_semaphore_is_rejected_but_doesnt_abort_the_tenant() {
        let config = UnparsedTenantConfig {
            sources: vec![ProjectSource {
                project: "org/repo".into(),
                branch: "main".into(),
                pipelines: vec![],
                jobs: serde_json::json!([]),
                semaphores: vec![SemaphoreConfig {
                    name: "broken".into(),
                    max_count: 0,
                    resources_first: false,
                }],
                nodesets: vec![],
            }],
        };

        let layout = build_layout(&config);
        assert_eq!(layout.loading_errors.len(), 1);
        assert!(layout.semaphores.is_empty());
    }
}
