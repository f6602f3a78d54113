//! The one seam where "loaded tenant configuration" enters this crate
//! (spec §1, §4.F): parsing the actual project YAML DSL into the generic
//! JSON shape [`zuul_layout::build_layout`] folds is out of scope, so a
//! [`TenantConfigLoader`] is the boundary a caller plugs a real loader into.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use zuul_layout::UnparsedTenantConfig;

use crate::error::SchedulerError;

#[async_trait]
pub trait TenantConfigLoader: Send + Sync {
    async fn load(&self, tenant: &str) -> Result<UnparsedTenantConfig, SchedulerError>;
}

/// An in-memory loader a caller seeds directly — the shape tests and the
/// in-process `MemoryCoordinationClient` harness use in place of a real
/// project-config fetcher.
#[derive(Default)]
pub struct StaticTenantConfigLoader {
    configs: RwLock<BTreeMap<String, UnparsedTenantConfig>>,
}

impl StaticTenantConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, tenant: impl Into<String>, config: UnparsedTenantConfig) {
        self.configs.write().await.insert(tenant.into(), config);
    }
}

#[async_trait]
impl TenantConfigLoader for StaticTenantConfigLoader {
    async fn load(&self, tenant: &str) -> Result<UnparsedTenantConfig, SchedulerError> {
        Ok(self.configs.read().await.get(tenant).cloned().unwrap_or_default())
    }
}

/// Reads `<dir>/<tenant>.json`, the on-disk shape a real project-config
/// fetcher would hand off as its already-parsed output (spec §1, §10).
/// A missing file is an empty config, not an error, matching
/// [`crate::config::load_config_from_file`]'s own missing-file handling.
pub struct FileTenantConfigLoader {
    dir: PathBuf,
}

impl FileTenantConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TenantConfigLoader for FileTenantConfigLoader {
    async fn load(&self, tenant: &str) -> Result<UnparsedTenantConfig, SchedulerError> {
        let path = self.dir.join(format!("{tenant}.json"));
        if !path.exists() {
            return Ok(UnparsedTenantConfig::default());
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SchedulerError::Other(anyhow::anyhow!("reading tenant config {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SchedulerError::Other(anyhow::anyhow!("parsing tenant config {}: {e}", path.display())))
    }
}

pub type SharedTenantConfigLoader = Arc<dyn TenantConfigLoader>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_loader_returns_default_for_unknown_tenant() {
        let loader = StaticTenantConfigLoader::new();
        let config = loader.load("unknown").await.unwrap();
        assert!(config.sources.is_empty());
    }

    #[tokio::test]
    async fn file_loader_returns_default_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FileTenantConfigLoader::new(dir.path());
        let config = loader.load("t1").await.unwrap();
        assert!(config.sources.is_empty());
    }

    #[tokio::test]
    async fn file_loader_parses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = UnparsedTenantConfig {
            sources: vec![zuul_layout::ProjectSource {
                project: "org/repo".into(),
                branch: "main".into(),
                pipelines: vec![],
                jobs: serde_json::json!({}),
                semaphores: vec![],
                nodesets: vec![],
            }],
        };
        std::fs::write(dir.path().join("t1.json"), serde_json::to_string(&config).unwrap()).unwrap();

        let loader = FileTenantConfigLoader::new(dir.path());
        let loaded = loader.load("t1").await.unwrap();
        assert_eq!(loaded.sources.len(), 1);
    }
}
