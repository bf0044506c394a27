//! Scripted capabilities and engine builders shared by the integration tests.

use async_trait::async_trait;
use canopy::capability::{
    Capabilities, Critic, CriticVerdict, Embedder, Metered, Moderator, Mutator, Persona, RetryPolicy,
    Verdict,
};
use canopy::conversation::Turn;
use canopy::engine::{Engine, EngineOptions};
use canopy::error::CapabilityError;
use canopy::events::{EventReceiver, GraphEvent};
use canopy::settings::RunConfiguration;
use canopy::store::{MemoryNodeStore, NodeStore};
use canopy::types::{Embedding, TokenUsage};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MUTATE_COST: f64 = 0.03;
pub const REPLY_COST: f64 = 0.01;
pub const CRITIC_COST: f64 = 0.002;
pub const EMBED_COST: f64 = 0.0001;

#[derive(Default)]
pub struct CallCounts {
    pub mutate: AtomicUsize,
    pub reply: AtomicUsize,
    pub criticize: AtomicUsize,
    pub moderate: AtomicUsize,
    pub embed: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// One object playing every capability. Behaviour is keyed by the candidate
/// prompt text.
pub struct Script {
    /// Prompts handed out by the mutator, in order
    pub proposals: Vec<String>,
    pub scores: HashMap<String, f64>,
    pub blocked: HashSet<String>,
    /// Persona fails permanently for these prompts
    pub persona_fails: HashSet<String>,
    /// Persona fails transiently this many times before succeeding
    pub persona_flaky: Mutex<HashMap<String, usize>>,
    /// Critic answers with unparseable text for these prompts
    pub garbled: HashSet<String>,
    pub mutator_fails: bool,
    pub moderator_fails: bool,
    pub embedder_fails: bool,
    pub calls: CallCounts,
}

impl Script {
    pub fn new(proposals: &[(&str, f64)]) -> Self {
        Self {
            proposals: proposals.iter().map(|(p, _)| p.to_string()).collect(),
            scores: proposals.iter().map(|(p, s)| (p.to_string(), *s)).collect(),
            blocked: HashSet::new(),
            persona_fails: HashSet::new(),
            persona_flaky: Mutex::new(HashMap::new()),
            garbled: HashSet::new(),
            mutator_fails: false,
            moderator_fails: false,
            embedder_fails: false,
            calls: CallCounts::default(),
        }
    }

    pub fn block(mut self, prompt: &str) -> Self {
        self.blocked.insert(prompt.to_string());
        self
    }

    pub fn fail_persona(mut self, prompt: &str) -> Self {
        self.persona_fails.insert(prompt.to_string());
        self
    }

    pub fn flaky_persona(self, prompt: &str, failures: usize) -> Self {
        self.persona_flaky.lock().insert(prompt.to_string(), failures);
        self
    }

    pub fn garble(mut self, prompt: &str) -> Self {
        self.garbled.insert(prompt.to_string());
        self
    }

    pub fn into_capabilities(self) -> (Arc<Script>, Capabilities) {
        let script = Arc::new(self);
        let caps = Capabilities {
            mutator: script.clone(),
            persona: script.clone(),
            critic: script.clone(),
            moderator: script.clone(),
            embedder: script.clone(),
        };
        (script, caps)
    }
}

/// Deterministic embedding: distinct texts get distinct directions.
pub fn fake_embedding(text: &str) -> Embedding {
    let bytes = text.as_bytes();
    let sum: u32 = bytes.iter().map(|b| *b as u32).sum();
    vec![
        bytes.len() as f32,
        (sum % 97) as f32,
        bytes.first().copied().unwrap_or(0) as f32,
        1.0,
    ]
}

#[async_trait]
impl Mutator for Script {
    async fn mutate(
        &self,
        _context: &[Turn],
        count: usize,
    ) -> Result<Metered<Vec<String>>, CapabilityError> {
        self.calls.mutate.fetch_add(1, Ordering::SeqCst);
        if self.mutator_fails {
            return Err(CapabilityError::InvalidResponse("mutator down".to_string()));
        }
        let prompts = self.proposals.iter().take(count).cloned().collect();
        Ok(Metered::new(prompts, MUTATE_COST, TokenUsage::new(30, 30)))
    }
}

#[async_trait]
impl Persona for Script {
    async fn reply(&self, prompt: &str, _context: &[Turn]) -> Result<Metered<String>, CapabilityError> {
        self.calls.reply.fetch_add(1, Ordering::SeqCst);
        if self.persona_fails.contains(prompt) {
            return Err(CapabilityError::Auth("persona rejected".to_string()));
        }
        {
            let mut flaky = self.persona_flaky.lock();
            if let Some(remaining) = flaky.get_mut(prompt) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CapabilityError::Timeout("persona slow".to_string()));
                }
            }
        }
        Ok(Metered::new(
            format!("reply to {}", prompt),
            REPLY_COST,
            TokenUsage::new(10, 5),
        ))
    }
}

#[async_trait]
impl Critic for Script {
    async fn criticize(&self, trajectory: &[Turn]) -> Result<Metered<CriticVerdict>, CapabilityError> {
        self.calls.criticize.fetch_add(1, Ordering::SeqCst);
        let prompt = trajectory
            .len()
            .checked_sub(2)
            .map(|i| trajectory[i].text.clone())
            .unwrap_or_default();
        let verdict = if self.garbled.contains(&prompt) {
            CriticVerdict::ParseFailure {
                raw: "pretty good I guess".to_string(),
            }
        } else {
            CriticVerdict::Score {
                value: self.scores.get(&prompt).copied().unwrap_or(0.5),
                analysis: Some(format!("{} turns", trajectory.len())),
            }
        };
        Ok(Metered::new(verdict, CRITIC_COST, TokenUsage::new(20, 2)))
    }
}

#[async_trait]
impl Moderator for Script {
    async fn moderate(&self, text: &str) -> Result<Metered<Verdict>, CapabilityError> {
        self.calls.moderate.fetch_add(1, Ordering::SeqCst);
        if self.moderator_fails {
            return Err(CapabilityError::Request("moderation offline".to_string()));
        }
        if self.blocked.contains(text) {
            Ok(Metered::free(Verdict::Blocked {
                categories: vec!["harassment".to_string()],
            }))
        } else {
            Ok(Metered::free(Verdict::Allowed))
        }
    }
}

#[async_trait]
impl Embedder for Script {
    async fn embed(&self, text: &str) -> Result<Metered<Embedding>, CapabilityError> {
        self.calls.embed.fetch_add(1, Ordering::SeqCst);
        if self.embedder_fails {
            return Err(CapabilityError::NotConfigured("no embedder".to_string()));
        }
        Ok(Metered::new(fake_embedding(text), EMBED_COST, TokenUsage::new(4, 0)))
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

pub fn engine_with_store(store: Arc<dyn NodeStore>, caps: Capabilities, config: RunConfiguration) -> Engine {
    Engine::new(
        store,
        caps,
        config,
        EngineOptions {
            retry: fast_retry(),
            ..Default::default()
        },
    )
}

pub fn engine(caps: Capabilities) -> Engine {
    engine_with_store(
        Arc::new(MemoryNodeStore::new()),
        caps,
        RunConfiguration::default(),
    )
}

/// Everything currently buffered on `rx`.
pub fn drain(rx: &mut EventReceiver) -> Vec<GraphEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
