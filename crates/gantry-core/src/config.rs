//! Configuration for the gantry execution core.
//!
//! Loaded from defaults layered with `GANTRY__`-prefixed environment
//! variables (`GANTRY__STORAGE__DATABASE_PATH`, ...). Every section is
//! also directly constructible so tests can point isolated instances
//! at ephemeral storage.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GantryConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl GantryConfig {
    /// Load configuration from the environment with the default prefix.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("GANTRY")
    }

    /// Load configuration from the environment with a custom prefix.
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("storage.database_path", "./gantry/tasks.db")?
            .set_default("storage.runs_dir", "./gantry/runs")?
            .set_default("storage.artifacts_dir", "./gantry/artifacts")?
            .set_default("storage.approvals_dir", "./gantry/approvals")?
            .set_default("storage.max_connections", 5)?
            .set_default("storage.cache_ttl_secs", 300)?
            .set_default("approval.default_timeout_secs", 300)?
            .set_default("approval.sweep_interval_secs", 60)?
            .set_default("executor.default_step_timeout_secs", 300)?
            .set_default("executor.artifact_threshold_bytes", 100)?
            .set_default("executor.list_limit", 50)?;

        let config = builder.build()?;
        config.try_deserialize()
    }
}

/// Where task rows, run manifests, approvals, and artifacts live.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file for task lists and tasks
    pub database_path: PathBuf,
    /// Directory for run manifests (one JSON file per run)
    pub runs_dir: PathBuf,
    /// Directory for step artifacts (one subdirectory per run)
    pub artifacts_dir: PathBuf,
    /// Directory for approval requests (one JSON file per request)
    pub approvals_dir: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// TTL for the in-memory task list cache
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl StorageConfig {
    /// Root every storage path under the given base directory.
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            database_path: base.join("tasks.db"),
            runs_dir: base.join("runs"),
            artifacts_dir: base.join("artifacts"),
            approvals_dir: base.join("approvals"),
            max_connections: default_max_connections(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }

    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::under("./gantry")
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_cache_ttl_secs() -> u64 {
    300
}

/// Approval gateway tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Default request time-to-live when the caller gives none
    #[serde(default = "default_approval_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl ApprovalConfig {
    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_approval_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_approval_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Run executor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Per-step wall-clock timeout when the step declares none
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Output size past which a step result is spilled to an artifact file
    #[serde(default = "default_artifact_threshold")]
    pub artifact_threshold_bytes: usize,
    /// Page size for run/approval listings
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl ExecutorConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            artifact_threshold_bytes: default_artifact_threshold(),
            list_limit: default_list_limit(),
        }
    }
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_artifact_threshold() -> usize {
    100
}

fn default_list_limit() -> usize {
    50
}
