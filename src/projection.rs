//! Embedding projection
//!
//! Maps embeddings to 2-D display positions with a fixed random projection.
//! The two axes are expanded from a seed with BLAKE3's extendable output, so
//! the same embedding lands on the same point in every process.

use crate::types::{Embedding, Position};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_SEED: &str = "canopy.projection.v1";

/// Default spread of projected positions.
pub const DEFAULT_SCALE: f64 = 4.0;

type Axes = Arc<(Vec<f64>, Vec<f64>)>;

pub struct Projector {
    seed: String,
    scale: f64,
    /// Axes per embedding dimension
    axes: RwLock<HashMap<usize, Axes>>,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(DEFAULT_SEED, DEFAULT_SCALE)
    }
}

impl Projector {
    pub fn new(seed: impl Into<String>, scale: f64) -> Self {
        Self {
            seed: seed.into(),
            scale,
            axes: RwLock::new(HashMap::new()),
        }
    }

    /// Project `embedding`. Empty or zero-norm input maps to the origin.
    pub fn project(&self, embedding: &Embedding) -> Position {
        let norm = embedding
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt();
        if embedding.is_empty() || norm == 0.0 || !norm.is_finite() {
            return Position::new(0.0, 0.0);
        }

        let axes = self.axes_for(embedding.len());
        let (mut x, mut y) = (0.0, 0.0);
        for (i, v) in embedding.iter().enumerate() {
            let v = f64::from(*v) / norm;
            x += v * axes.0[i];
            y += v * axes.1[i];
        }
        Position::new(x * self.scale, y * self.scale)
    }

    fn axes_for(&self, dim: usize) -> Axes {
        if let Some(axes) = self.axes.read().get(&dim) {
            return axes.clone();
        }
        let axes: Axes = Arc::new((self.derive_axis(dim, 0), self.derive_axis(dim, 1)));
        self.axes.write().entry(dim).or_insert(axes).clone()
    }

    /// Components uniform in [-1, 1].
    fn derive_axis(&self, dim: usize, index: u8) -> Vec<f64> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(&(dim as u64).to_le_bytes());
        hasher.update(&[index]);
        let mut reader = hasher.finalize_xof();

        let mut bytes = vec![0u8; dim * 4];
        reader.fill(&mut bytes);
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                (f64::from(raw) / f64::from(u32::MAX)) * 2.0 - 1.0
            })
            .collect()
    }
}
