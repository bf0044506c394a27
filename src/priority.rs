//! Priority Engine
//!
//! Admission priority for a freshly scored node:
//!
//! ```text
//! priority = score + trend·(score − parent_score) − sim·top_k_similarity − depth_weight·depth
//! ```

use serde::{Deserialize, Serialize};

/// Live-tunable weights of the priority formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    /// Reward for improving on the parent's score
    #[serde(default = "default_trend")]
    pub trend: f64,
    /// Penalty for resembling the current best nodes
    #[serde(default = "default_sim")]
    pub sim: f64,
    /// Penalty per level of depth
    #[serde(default = "default_depth")]
    pub depth: f64,
}

fn default_trend() -> f64 {
    0.3
}

fn default_sim() -> f64 {
    0.2
}

fn default_depth() -> f64 {
    0.05
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            trend: default_trend(),
            sim: default_sim(),
            depth: default_depth(),
        }
    }
}

impl PriorityWeights {
    pub fn is_finite(&self) -> bool {
        self.trend.is_finite() && self.sim.is_finite() && self.depth.is_finite()
    }
}

/// Inputs for one priority computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInputs {
    pub score: f64,
    /// `None` for roots or unscored parents; falls back to `score`.
    pub parent_score: Option<f64>,
    pub top_k_similarity: f64,
    pub depth: u32,
}

pub fn compute_priority(inputs: &PriorityInputs, weights: &PriorityWeights) -> f64 {
    let parent_score = inputs.parent_score.unwrap_or(inputs.score);
    inputs.score + weights.trend * (inputs.score - parent_score)
        - weights.sim * inputs.top_k_similarity
        - weights.depth * f64::from(inputs.depth)
}

/// Cosine similarity of two vectors. Zero when either vector has zero norm or
/// the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Maximum cosine similarity between `embedding` and any of `reference`.
/// An empty reference set yields zero (no penalty).
pub fn max_similarity<'a, I>(embedding: &[f32], reference: I) -> f64
where
    I: IntoIterator<Item = &'a [f32]>,
{
    reference
        .into_iter()
        .map(|other| cosine_similarity(embedding, other))
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
        .unwrap_or(0.0)
}
