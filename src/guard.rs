//! Budget & Moderation Guard
//!
//! The ledger holds cumulative spend as integer micro-dollars so concurrent
//! charges are plain atomic additions.

use crate::capability::{Moderator, Verdict};
use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const MICROS_PER_USD: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Process-wide spend counter and limit.
#[derive(Debug)]
pub struct BudgetLedger {
    spent_micros: AtomicU64,
    limit_micros: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    charges: AtomicU64,
}

impl BudgetLedger {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            spent_micros: AtomicU64::new(0),
            limit_micros: AtomicU64::new(to_micros(limit_usd)),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            charges: AtomicU64::new(0),
        }
    }

    /// Record one billable call. Negative or non-finite costs count as zero.
    pub fn charge(&self, cost_usd: f64, usage: TokenUsage) {
        self.spent_micros
            .fetch_add(to_micros(cost_usd), Ordering::AcqRel);
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.charges.fetch_add(1, Ordering::Relaxed);
    }

    /// Seed the spend counter, e.g. from node costs recorded by an earlier run.
    pub fn restore_spent(&self, spent_usd: f64) {
        self.spent_micros
            .store(to_micros(spent_usd), Ordering::Release);
    }

    pub fn set_limit(&self, limit_usd: f64) {
        self.limit_micros
            .store(to_micros(limit_usd), Ordering::Release);
    }

    pub fn spent(&self) -> f64 {
        from_micros(self.spent_micros.load(Ordering::Acquire))
    }

    pub fn limit(&self) -> f64 {
        from_micros(self.limit_micros.load(Ordering::Acquire))
    }

    pub fn remaining(&self) -> f64 {
        let spent = self.spent_micros.load(Ordering::Acquire);
        let limit = self.limit_micros.load(Ordering::Acquire);
        from_micros(limit.saturating_sub(spent))
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }

    pub fn charge_count(&self) -> u64 {
        self.charges.load(Ordering::Relaxed)
    }
}

/// Result of the pre-pop budget check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Admission {
    Allowed,
    Exhausted { spent: f64, limit: f64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Compare cumulative spend against the limit. Spend equal to the limit is
/// already exhausted.
pub fn check_admission(ledger: &BudgetLedger) -> Admission {
    let spent = ledger.spent_micros.load(Ordering::Acquire);
    let limit = ledger.limit_micros.load(Ordering::Acquire);
    if spent >= limit {
        Admission::Exhausted {
            spent: from_micros(spent),
            limit: from_micros(limit),
        }
    } else {
        Admission::Allowed
    }
}

/// Screen `text` before it reaches the persona or critic.
///
/// Moderation fails open: an erroring moderator yields `Allowed`. A blocked
/// branch records no cost; only an `Allowed` screening is charged.
pub async fn check_moderation(
    moderator: &dyn Moderator,
    ledger: &BudgetLedger,
    text: &str,
) -> Verdict {
    match moderator.moderate(text).await {
        Ok(metered) => {
            match &metered.value {
                Verdict::Blocked { categories } => {
                    debug!(categories = ?categories, "Candidate blocked by moderation");
                }
                Verdict::Allowed => {
                    if metered.cost_usd > 0.0 || metered.usage.total() > 0 {
                        ledger.charge(metered.cost_usd, metered.usage);
                    }
                }
            }
            metered.value
        }
        Err(err) => {
            warn!(error = %err, "Moderation unavailable, allowing candidate");
            Verdict::Allowed
        }
    }
}
