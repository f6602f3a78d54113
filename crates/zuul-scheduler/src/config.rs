//! Typed scheduler configuration (spec §10): built-in defaults layered under
//! an optional TOML file, in turn layered under `ZUUL_*` environment
//! overrides — the same three-tier shape the reference crate's own config
//! crate uses for its runtime options.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn default_command_socket_path() -> PathBuf {
    PathBuf::from("/var/run/zuul/scheduler.socket")
}

fn default_lock_timeout_ms() -> u64 {
    0
}

fn default_tick_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSocketConfig {
    pub path: PathBuf,
}

impl Default for CommandSocketConfig {
    fn default() -> Self {
        Self {
            path: default_command_socket_path(),
        }
    }
}

fn default_semaphore_leak_secs() -> u64 {
    3600
}
fn default_build_request_secs() -> u64 {
    60
}
fn default_merge_request_secs() -> u64 {
    60
}
fn default_connection_cache_secs() -> u64 {
    300
}
fn default_general_secs() -> u64 {
    3600
}
fn default_retention_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(default = "default_semaphore_leak_secs")]
    pub semaphore_leak_interval_secs: u64,
    #[serde(default = "default_build_request_secs")]
    pub build_request_interval_secs: u64,
    #[serde(default = "default_merge_request_secs")]
    pub merge_request_interval_secs: u64,
    #[serde(default = "default_connection_cache_secs")]
    pub connection_cache_interval_secs: u64,
    #[serde(default = "default_general_secs")]
    pub general_interval_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub connection_cache_retention_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            semaphore_leak_interval_secs: default_semaphore_leak_secs(),
            build_request_interval_secs: default_build_request_secs(),
            merge_request_interval_secs: default_merge_request_secs(),
            connection_cache_interval_secs: default_connection_cache_secs(),
            general_interval_secs: default_general_secs(),
            connection_cache_retention_secs: default_retention_secs(),
        }
    }
}

impl CleanupConfig {
    pub fn semaphore_leak_interval(&self) -> Duration {
        Duration::from_secs(self.semaphore_leak_interval_secs)
    }
    pub fn build_request_interval(&self) -> Duration {
        Duration::from_secs(self.build_request_interval_secs)
    }
    pub fn merge_request_interval(&self) -> Duration {
        Duration::from_secs(self.merge_request_interval_secs)
    }
    pub fn connection_cache_interval(&self) -> Duration {
        Duration::from_secs(self.connection_cache_interval_secs)
    }
    pub fn general_interval(&self) -> Duration {
        Duration::from_secs(self.general_interval_secs)
    }
    pub fn connection_cache_retention(&self) -> Duration {
        Duration::from_secs(self.connection_cache_retention_secs)
    }
}

fn default_stats_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    #[serde(default = "default_stats_interval_secs")]
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval_secs(),
        }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    pub zone: Option<String>,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            zone: None,
        }
    }
}

/// Top-level scheduler configuration. Every field layers defaults → file →
/// `ZUUL_*` environment overrides (spec §10); nothing is required to be
/// present in the file for a valid config to load.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    pub component: ComponentConfig,
    pub cleanup: CleanupConfig,
    pub stats: StatsConfig,
    pub command_socket: CommandSocketConfig,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_tick_secs")]
    pub main_loop_tick_secs: u64,
}

impl SchedulerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn main_loop_tick(&self) -> Duration {
        Duration::from_secs(self.main_loop_tick_secs)
    }

    /// `other` wins field-by-field wherever it differs from the built-in
    /// default, mirroring the layered-config merge the reference crate's
    /// config crate uses to combine a file with environment overrides.
    pub fn merge(&self, other: &SchedulerConfig) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            component: ComponentConfig {
                hostname: if other.component.hostname != defaults.component.hostname {
                    other.component.hostname.clone()
                } else {
                    self.component.hostname.clone()
                },
                zone: other.component.zone.clone().or_else(|| self.component.zone.clone()),
            },
            cleanup: if other.cleanup.semaphore_leak_interval_secs != defaults.cleanup.semaphore_leak_interval_secs
                || other.cleanup.build_request_interval_secs != defaults.cleanup.build_request_interval_secs
                || other.cleanup.merge_request_interval_secs != defaults.cleanup.merge_request_interval_secs
                || other.cleanup.connection_cache_interval_secs != defaults.cleanup.connection_cache_interval_secs
                || other.cleanup.general_interval_secs != defaults.cleanup.general_interval_secs
            {
                other.cleanup.clone()
            } else {
                self.cleanup.clone()
            },
            stats: if other.stats.interval_secs != defaults.stats.interval_secs {
                other.stats.clone()
            } else {
                self.stats.clone()
            },
            command_socket: if other.command_socket.path != defaults.command_socket.path {
                other.command_socket.clone()
            } else {
                self.command_socket.clone()
            },
            lock_timeout_ms: if other.lock_timeout_ms != defaults.lock_timeout_ms {
                other.lock_timeout_ms
            } else {
                self.lock_timeout_ms
            },
            main_loop_tick_secs: if other.main_loop_tick_secs != defaults.main_loop_tick_secs {
                other.main_loop_tick_secs
            } else {
                self.main_loop_tick_secs
            },
        }
    }

    /// Applies `ZUUL_*` environment overrides on top of whatever was
    /// loaded from defaults/file, matching spec §10's three-tier layering.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("ZUUL_HOSTNAME") {
            self.component.hostname = v;
        }
        if let Ok(v) = env::var("ZUUL_ZONE") {
            self.component.zone = Some(v);
        }
        if let Ok(v) = env::var("ZUUL_COMMAND_SOCKET") {
            self.command_socket.path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("ZUUL_STATS_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.stats.interval_secs = n;
            }
        }
        if let Ok(v) = env::var("ZUUL_LOCK_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.lock_timeout_ms = n;
            }
        }
    }
}

pub fn load_config_from_file(path: &Path) -> Result<SchedulerConfig> {
    if !path.exists() {
        return Ok(SchedulerConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading scheduler config at {}", path.display()))?;
    let mut config: SchedulerConfig =
        toml::from_str(&raw).with_context(|| format!("parsing scheduler config at {}", path.display()))?;
    config.apply_env_overrides();
    Ok(config)
}

pub fn load_config(dir: &Path) -> Result<SchedulerConfig> {
    load_config_from_file(&dir.join("zuul-scheduler.toml"))
}

pub fn save_config(dir: &Path, config: &SchedulerConfig) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let rendered = toml::to_string_pretty(config).context("serializing scheduler config")?;
    std::fs::write(dir.join("zuul-scheduler.toml"), rendered).context("writing scheduler config")
}

/// Walks up from `start_dir` looking for a `zuul-scheduler.toml`, the same
/// upward-search the reference crate's config crate uses for its own
/// dotfile.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = Some(start_dir.to_path_buf());
    while let Some(d) = dir {
        let candidate = d.join("zuul-scheduler.toml");
        if candidate.exists() {
            return Some(candidate);
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.stats.interval_secs, 30);
        assert_eq!(config.cleanup.general_interval_secs, 3600);
    }

    #[test]
    fn file_overrides_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.stats.interval_secs = 45;
        config.component.zone = Some("us-west".into());
        save_config(dir.path(), &config).unwrap();

        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded.stats.interval_secs, 45);
        assert_eq!(loaded.component.zone.as_deref(), Some("us-west"));
    }

    #[test]
    fn merge_prefers_non_default_fields_from_other() {
        let base = SchedulerConfig::default();
        let mut override_cfg = SchedulerConfig::default();
        override_cfg.stats.interval_secs = 60;

        let merged = base.merge(&override_cfg);
        assert_eq!(merged.stats.interval_secs, 60);
        assert_eq!(merged.cleanup.general_interval_secs, 3600);
    }

    #[test]
    fn find_config_walks_up_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        save_config(dir.path(), &SchedulerConfig::default()).unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, dir.path().join("zuul-scheduler.toml"));
    }
}
