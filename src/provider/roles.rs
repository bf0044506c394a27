//! Capability adapters over [`OpenAiClient`].

use super::{ChatMessage, ChatOptions, MessageRole, OpenAiClient, PromptConfig};
use crate::capability::{
    Capabilities, Critic, CriticVerdict, Embedder, Metered, Moderator, Mutator, Persona, Verdict,
};
use crate::conversation::{render_transcript, Role, Turn};
use crate::error::CapabilityError;
use crate::types::{Embedding, TokenUsage};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

fn transcript(prompts: &PromptConfig, turns: &[Turn]) -> String {
    render_transcript(turns, &prompts.human_label, &prompts.agent_label)
}

/// Proposes follow-ups with independent samples, one call per candidate.
pub struct LlmMutator {
    client: Arc<OpenAiClient>,
}

impl LlmMutator {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }

    fn messages(&self, context: &[Turn]) -> Vec<ChatMessage> {
        let prompts = &self.client.config().prompts;
        let system = format!("{}\n\nGoal: {}", prompts.mutator_system, prompts.goal);
        let user = if context.is_empty() {
            "Write an opening message for the conversation.".to_string()
        } else {
            format!(
                "Conversation so far:\n\n{}\n\nWrite the next {} message:",
                transcript(prompts, context),
                prompts.human_label
            )
        };
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

#[async_trait]
impl Mutator for LlmMutator {
    async fn mutate(
        &self,
        context: &[Turn],
        count: usize,
    ) -> Result<Metered<Vec<String>>, CapabilityError> {
        let config = self.client.config();
        let messages = self.messages(context);
        let options = ChatOptions {
            temperature: Some(config.mutator_temperature),
            ..Default::default()
        };

        let calls = (0..count).map(|_| {
            self.client
                .chat(&config.mutator_model, messages.clone(), &options)
        });
        let results = join_all(calls).await;

        let mut candidates = Vec::with_capacity(count);
        let mut cost = 0.0;
        let mut usage = TokenUsage::default();
        let mut last_error = None;
        for result in results {
            match result {
                Ok(metered) => {
                    cost += metered.cost_usd;
                    usage += metered.usage;
                    let text = metered.value.trim().trim_matches('"').trim().to_string();
                    if !text.is_empty() {
                        candidates.push(text);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Mutator sample failed");
                    last_error = Some(err);
                }
            }
        }

        match (candidates.is_empty(), last_error) {
            (true, Some(err)) => Err(err),
            _ => Ok(Metered::new(candidates, cost, usage)),
        }
    }
}

pub struct LlmPersona {
    client: Arc<OpenAiClient>,
}

impl LlmPersona {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Persona for LlmPersona {
    async fn reply(
        &self,
        prompt: &str,
        context: &[Turn],
    ) -> Result<Metered<String>, CapabilityError> {
        let config = self.client.config();
        let mut messages = vec![ChatMessage::system(config.prompts.persona_system.clone())];
        for turn in context {
            messages.push(ChatMessage {
                role: match turn.role {
                    Role::Human => MessageRole::User,
                    Role::Agent => MessageRole::Assistant,
                },
                content: turn.text.clone(),
            });
        }
        messages.push(ChatMessage::user(prompt));

        let options = ChatOptions {
            temperature: Some(config.persona_temperature),
            ..Default::default()
        };
        let metered = self
            .client
            .chat(&config.persona_model, messages, &options)
            .await?;
        Ok(metered.map(|reply| reply.trim().to_string()))
    }
}

#[derive(Deserialize)]
struct CriticReply {
    #[serde(default)]
    analysis: Option<String>,
    score: f64,
}

/// Read a critic reply as `{analysis, score}`. Tolerates prose or code fences
/// around the object; anything else is a parse failure.
pub fn parse_critic_reply(raw: &str) -> CriticVerdict {
    let candidate = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw.trim(),
    };
    match serde_json::from_str::<CriticReply>(candidate) {
        Ok(reply) => CriticVerdict::from_value(reply.score, reply.analysis, raw),
        Err(err) => {
            debug!(error = %err, "Critic reply is not a score object");
            CriticVerdict::ParseFailure {
                raw: raw.to_string(),
            }
        }
    }
}

pub struct LlmCritic {
    client: Arc<OpenAiClient>,
}

impl LlmCritic {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Critic for LlmCritic {
    async fn criticize(
        &self,
        trajectory: &[Turn],
    ) -> Result<Metered<CriticVerdict>, CapabilityError> {
        let config = self.client.config();
        let prompts = &config.prompts;
        let messages = vec![
            ChatMessage::system(format!("{}\n\nGoal: {}", prompts.critic_system, prompts.goal)),
            ChatMessage::user(format!(
                "Score this conversation:\n\n{}",
                transcript(prompts, trajectory)
            )),
        ];
        let options = ChatOptions {
            temperature: Some(config.critic_temperature),
            json_object: true,
            ..Default::default()
        };
        let metered = self
            .client
            .chat(&config.critic_model, messages, &options)
            .await?;
        Ok(metered.map(|raw| parse_critic_reply(&raw)))
    }
}

pub struct LlmModerator {
    client: Arc<OpenAiClient>,
}

impl LlmModerator {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Moderator for LlmModerator {
    async fn moderate(&self, text: &str) -> Result<Metered<Verdict>, CapabilityError> {
        self.client.moderate(text).await
    }
}

/// Used when the endpoint has no moderation API.
pub struct DisabledModerator;

#[async_trait]
impl Moderator for DisabledModerator {
    async fn moderate(&self, _text: &str) -> Result<Metered<Verdict>, CapabilityError> {
        Ok(Metered::free(Verdict::Allowed))
    }
}

pub struct LlmEmbedder {
    client: Arc<OpenAiClient>,
}

impl LlmEmbedder {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Embedder for LlmEmbedder {
    async fn embed(&self, text: &str) -> Result<Metered<Embedding>, CapabilityError> {
        self.client.embed(text).await
    }
}

/// Stand-in for every capability when no provider can be built. Each call
/// fails with `NotConfigured`, which is never retried.
pub struct Unconfigured {
    reason: String,
}

impl Unconfigured {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> CapabilityError {
        CapabilityError::NotConfigured(self.reason.clone())
    }
}

#[async_trait]
impl Mutator for Unconfigured {
    async fn mutate(&self, _: &[Turn], _: usize) -> Result<Metered<Vec<String>>, CapabilityError> {
        Err(self.error())
    }
}

#[async_trait]
impl Persona for Unconfigured {
    async fn reply(&self, _: &str, _: &[Turn]) -> Result<Metered<String>, CapabilityError> {
        Err(self.error())
    }
}

#[async_trait]
impl Critic for Unconfigured {
    async fn criticize(&self, _: &[Turn]) -> Result<Metered<CriticVerdict>, CapabilityError> {
        Err(self.error())
    }
}

#[async_trait]
impl Moderator for Unconfigured {
    async fn moderate(&self, _: &str) -> Result<Metered<Verdict>, CapabilityError> {
        Err(self.error())
    }
}

#[async_trait]
impl Embedder for Unconfigured {
    async fn embed(&self, _: &str) -> Result<Metered<Embedding>, CapabilityError> {
        Err(self.error())
    }
}

pub fn unconfigured_capabilities(reason: impl Into<String>) -> Capabilities {
    let stub = Arc::new(Unconfigured::new(reason));
    Capabilities {
        mutator: stub.clone(),
        persona: stub.clone(),
        critic: stub.clone(),
        moderator: stub.clone(),
        embedder: stub,
    }
}

/// Wire all five capabilities to one shared client. With moderation turned
/// off every candidate is allowed.
pub fn http_capabilities(client: Arc<OpenAiClient>) -> Capabilities {
    let moderator: Arc<dyn Moderator> = if client.config().moderation_enabled {
        Arc::new(LlmModerator::new(client.clone()))
    } else {
        Arc::new(DisabledModerator)
    };
    Capabilities {
        mutator: Arc::new(LlmMutator::new(client.clone())),
        persona: Arc::new(LlmPersona::new(client.clone())),
        critic: Arc::new(LlmCritic::new(client.clone())),
        moderator,
        embedder: Arc::new(LlmEmbedder::new(client)),
    }
}
