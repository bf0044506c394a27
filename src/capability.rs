//! Generation capabilities
//!
//! The explorer consumes text generation, scoring, moderation and embedding as
//! opaque async capabilities. Every successful call reports what it cost so the
//! caller can charge the budget ledger.

use crate::conversation::Turn;
use crate::error::CapabilityError;
use crate::types::{Embedding, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// A capability result together with the cost of producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct Metered<T> {
    pub value: T,
    pub cost_usd: f64,
    pub usage: TokenUsage,
}

impl<T> Metered<T> {
    pub fn new(value: T, cost_usd: f64, usage: TokenUsage) -> Self {
        Self {
            value,
            cost_usd,
            usage,
        }
    }

    /// A result that cost nothing.
    pub fn free(value: T) -> Self {
        Self::new(value, 0.0, TokenUsage::default())
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Metered<U> {
        Metered {
            value: f(self.value),
            cost_usd: self.cost_usd,
            usage: self.usage,
        }
    }
}

/// Moderation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allowed,
    Blocked { categories: Vec<String> },
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked { .. })
    }
}

/// Typed critic output. A reply that cannot be read as a score in [0,1] is
/// kept as raw text instead of being coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CriticVerdict {
    Score {
        value: f64,
        analysis: Option<String>,
    },
    ParseFailure {
        raw: String,
    },
}

impl CriticVerdict {
    /// Build a verdict from a raw number, rejecting values outside [0,1].
    pub fn from_value(value: f64, analysis: Option<String>, raw: &str) -> Self {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            CriticVerdict::Score { value, analysis }
        } else {
            CriticVerdict::ParseFailure {
                raw: raw.to_string(),
            }
        }
    }
}

/// Proposes follow-up prompts for a conversation.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn mutate(
        &self,
        context: &[Turn],
        count: usize,
    ) -> Result<Metered<Vec<String>>, CapabilityError>;
}

/// Replies in character to a candidate prompt.
#[async_trait]
pub trait Persona: Send + Sync {
    async fn reply(&self, prompt: &str, context: &[Turn])
        -> Result<Metered<String>, CapabilityError>;
}

/// Scores a whole root-to-leaf trajectory.
#[async_trait]
pub trait Critic: Send + Sync {
    async fn criticize(&self, trajectory: &[Turn])
        -> Result<Metered<CriticVerdict>, CapabilityError>;
}

#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate(&self, text: &str) -> Result<Metered<Verdict>, CapabilityError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Metered<Embedding>, CapabilityError>;
}

/// The capability set handed to the explorer.
#[derive(Clone)]
pub struct Capabilities {
    pub mutator: Arc<dyn Mutator>,
    pub persona: Arc<dyn Persona>,
    pub critic: Arc<dyn Critic>,
    pub moderator: Arc<dyn Moderator>,
    pub embedder: Arc<dyn Embedder>,
}

/// Retry policy for transient capability failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1` (attempt counts from 1).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16) as u32;
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
/// Only errors with [`CapabilityError::is_transient`] are retried.
pub async fn retry_capability<T, F, Fut>(
    name: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    capability = name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Capability call failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
