//! Configuration System
//!
//! Layered configuration: built-in defaults, the global user file, workspace
//! files, then `CANOPY__SECTION__KEY` environment overrides.

use crate::capability::RetryPolicy;
use crate::conversation::DEFAULT_MAX_TRAVERSAL_DEPTH;
use crate::engine::EngineOptions;
use crate::error::ExploreError;
use crate::logging::LoggingConfig;
use crate::priority::PriorityWeights;
use crate::settings::RunConfiguration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod merge;
mod sources;

pub use crate::provider::{ModelPrice, PromptConfig, ProviderConfig};
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanopyConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub explorer: ExplorerConfig,

    #[serde(default)]
    pub priority: PriorityWeights,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub focus: FocusConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sled,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Sled directory; the platform data directory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved sled directory.
    pub fn store_path(&self) -> Result<PathBuf, ExploreError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        directories::ProjectDirs::from("", "", "canopy")
            .map(|dirs| dirs.data_dir().join("store"))
            .ok_or_else(|| {
                ExploreError::ConfigError(
                    "Cannot determine a data directory; set storage.path".to_string(),
                )
            })
    }
}

/// Worker scheduling knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_variants_per_node")]
    pub variants_per_node: usize,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Attempts per capability call, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Sleep between budget re-checks once the limit is reached
    #[serde(default = "default_budget_backoff_ms")]
    pub budget_backoff_ms: u64,

    /// Longest wait on an empty frontier before polling again
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long in-flight pipelines may run after a stop request
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_max_traversal_depth")]
    pub max_traversal_depth: usize,
}

fn default_batch_size() -> usize {
    20
}

fn default_variants_per_node() -> usize {
    3
}

fn default_top_k() -> usize {
    5
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_budget_backoff_ms() -> u64 {
    60_000
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_traversal_depth() -> usize {
    DEFAULT_MAX_TRAVERSAL_DEPTH
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            variants_per_node: default_variants_per_node(),
            top_k: default_top_k(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            budget_backoff_ms: default_budget_backoff_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_traversal_depth: default_max_traversal_depth(),
        }
    }
}

impl ExplorerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn budget_backoff(&self) -> Duration {
        Duration::from_millis(self.budget_backoff_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_traversal_depth: self.max_traversal_depth,
            retry: self.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_limit_usd")]
    pub limit_usd: f64,
}

fn default_limit_usd() -> f64 {
    5.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_usd: default_limit_usd(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusConfig {
    #[serde(default = "default_boost_delta")]
    pub boost_delta: f64,

    #[serde(default = "default_seed_priority")]
    pub seed_priority: f64,
}

fn default_boost_delta() -> f64 {
    0.5
}

fn default_seed_priority() -> f64 {
    1.0
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            boost_delta: default_boost_delta(),
            seed_priority: default_seed_priority(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Explorer(String),
    Priority(String),
    Budget(String),
    Focus(String),
    Provider(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Explorer(msg) => write!(f, "Explorer: {}", msg),
            ValidationError::Priority(msg) => write!(f, "Priority: {}", msg),
            ValidationError::Budget(msg) => write!(f, "Budget: {}", msg),
            ValidationError::Focus(msg) => write!(f, "Focus: {}", msg),
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CanopyConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let explorer = &self.explorer;
        if explorer.batch_size == 0 {
            errors.push(ValidationError::Explorer(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if explorer.variants_per_node == 0 {
            errors.push(ValidationError::Explorer(
                "variants_per_node must be at least 1".to_string(),
            ));
        }
        if explorer.retry_attempts == 0 {
            errors.push(ValidationError::Explorer(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if explorer.max_traversal_depth == 0 {
            errors.push(ValidationError::Explorer(
                "max_traversal_depth must be at least 1".to_string(),
            ));
        }
        if explorer.heartbeat_interval_ms == 0 {
            errors.push(ValidationError::Explorer(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }

        if !self.priority.is_finite() {
            errors.push(ValidationError::Priority(
                "weights must be finite numbers".to_string(),
            ));
        }

        if !self.budget.limit_usd.is_finite() || self.budget.limit_usd < 0.0 {
            errors.push(ValidationError::Budget(format!(
                "limit_usd must be non-negative, got {}",
                self.budget.limit_usd
            )));
        }

        if !self.focus.boost_delta.is_finite() || !self.focus.seed_priority.is_finite() {
            errors.push(ValidationError::Focus(
                "boost_delta and seed_priority must be finite".to_string(),
            ));
        }

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Initial live settings derived from this configuration.
    pub fn run_configuration(&self) -> RunConfiguration {
        RunConfiguration {
            weights: self.priority,
            batch_size: self.explorer.batch_size,
            variants_per_node: self.explorer.variants_per_node,
            top_k: self.explorer.top_k,
            focus_boost: self.focus.boost_delta,
            seed_priority: self.focus.seed_priority,
            budget_limit_usd: self.budget.limit_usd,
        }
    }
}

/// Loads [`CanopyConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for `workspace_root`.
    pub fn load(workspace_root: &Path) -> Result<CanopyConfig, ExploreError> {
        Self::load_with_global(workspace_root, global_config_path())
    }

    /// Like [`ConfigLoader::load`] with an explicit global file (or none).
    pub fn load_with_global(
        workspace_root: &Path,
        global_file: Option<PathBuf>,
    ) -> Result<CanopyConfig, ExploreError> {
        let mut builder = merge::merge_policy::builder_with_defaults()?;
        builder = sources::global_file::add_to_builder(builder, global_file)?;
        builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        builder = builder.add_source(
            config::Environment::with_prefix("CANOPY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: CanopyConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load a single file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<CanopyConfig, ExploreError> {
        let config: CanopyConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load and validate, folding validation errors into one message.
    pub fn load_validated(workspace_root: &Path) -> Result<CanopyConfig, ExploreError> {
        let config = Self::load(workspace_root)?;
        config.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ExploreError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}
