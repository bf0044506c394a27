//! Live run configuration
//!
//! Parameters the explorer reads at the start of every cycle. Updates apply to
//! work started afterwards; existing frontier entries keep their priority.

use crate::error::ExploreError;
use crate::guard::BudgetLedger;
use crate::priority::PriorityWeights;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub weights: PriorityWeights,
    /// Entries popped per cycle, also the pipeline parallelism
    pub batch_size: usize,
    /// Candidates requested from the mutator per expansion
    pub variants_per_node: usize,
    /// Size of the best-node set used for the similarity penalty
    pub top_k: usize,
    /// Priority delta applied by focus-zone `extend`
    pub focus_boost: f64,
    /// Priority given to a focus-zone `explore` seed
    pub seed_priority: f64,
    pub budget_limit_usd: f64,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            batch_size: 20,
            variants_per_node: 3,
            top_k: 5,
            focus_boost: 0.5,
            seed_priority: 1.0,
            budget_limit_usd: 5.0,
        }
    }
}

impl RunConfiguration {
    pub fn validate(&self) -> Result<(), ExploreError> {
        let mut problems = Vec::new();
        if !self.weights.is_finite() {
            problems.push("priority weights must be finite");
        }
        if self.batch_size == 0 {
            problems.push("batch_size must be at least 1");
        }
        if self.variants_per_node == 0 {
            problems.push("variants_per_node must be at least 1");
        }
        if !self.focus_boost.is_finite() || !self.seed_priority.is_finite() {
            problems.push("focus priorities must be finite");
        }
        if !self.budget_limit_usd.is_finite() || self.budget_limit_usd < 0.0 {
            problems.push("budget_limit_usd must be a non-negative number");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ExploreError::ConfigError(problems.join("; ")))
        }
    }
}

/// Partial settings update. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub lambda_trend: Option<f64>,
    pub lambda_sim: Option<f64>,
    pub lambda_depth: Option<f64>,
    pub batch_size: Option<usize>,
    pub variants_per_node: Option<usize>,
    pub top_k: Option<usize>,
    pub focus_boost: Option<f64>,
    pub budget_limit_usd: Option<f64>,
}

impl SettingsUpdate {
    fn apply_to(&self, config: &mut RunConfiguration) {
        if let Some(v) = self.lambda_trend {
            config.weights.trend = v;
        }
        if let Some(v) = self.lambda_sim {
            config.weights.sim = v;
        }
        if let Some(v) = self.lambda_depth {
            config.weights.depth = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.variants_per_node {
            config.variants_per_node = v;
        }
        if let Some(v) = self.top_k {
            config.top_k = v;
        }
        if let Some(v) = self.focus_boost {
            config.focus_boost = v;
        }
        if let Some(v) = self.budget_limit_usd {
            config.budget_limit_usd = v;
        }
    }
}

/// Shared handle over the live configuration. The budget limit lives in the
/// ledger so the admission gate sees changes immediately.
pub struct RunSettings {
    current: RwLock<RunConfiguration>,
    ledger: Arc<BudgetLedger>,
}

impl RunSettings {
    pub fn new(initial: RunConfiguration, ledger: Arc<BudgetLedger>) -> Self {
        ledger.set_limit(initial.budget_limit_usd);
        Self {
            current: RwLock::new(initial),
            ledger,
        }
    }

    pub fn snapshot(&self) -> RunConfiguration {
        let mut config = self.current.read().clone();
        config.budget_limit_usd = self.ledger.limit();
        config
    }

    /// Validate and apply `update`; returns the resulting configuration.
    /// An invalid update leaves the settings untouched.
    pub fn update(&self, update: &SettingsUpdate) -> Result<RunConfiguration, ExploreError> {
        let mut current = self.current.write();
        let mut next = current.clone();
        update.apply_to(&mut next);
        next.validate()?;

        if update.budget_limit_usd.is_some() {
            self.ledger.set_limit(next.budget_limit_usd);
        }
        *current = next.clone();
        info!(
            lambda_trend = next.weights.trend,
            lambda_sim = next.weights.sim,
            lambda_depth = next.weights.depth,
            batch_size = next.batch_size,
            budget_limit_usd = next.budget_limit_usd,
            "Run settings updated"
        );
        Ok(next)
    }
}
