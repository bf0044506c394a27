//! Model Provider
//!
//! HTTP client for OpenAI-compatible endpoints (OpenAI, OpenRouter, local
//! servers speaking the same API). Covers chat completions, embeddings and
//! moderation, and prices every call from the configured per-model table.
//! The capability adapters built on top of it live in [`roles`].

use crate::capability::{Metered, Verdict};
use crate::error::CapabilityError;
use crate::types::{Embedding, TokenUsage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

pub mod roles;

pub use roles::{
    http_capabilities, unconfigured_capabilities, DisabledModerator, LlmCritic, LlmEmbedder,
    LlmModerator, LlmMutator, LlmPersona, Unconfigured,
};

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPrice {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

fn default_pricing() -> HashMap<String, ModelPrice> {
    [
        ("gpt-4", ModelPrice::new(0.03, 0.06)),
        ("gpt-4-turbo", ModelPrice::new(0.01, 0.03)),
        ("gpt-4o-mini", ModelPrice::new(0.00015, 0.0006)),
        ("gpt-3.5-turbo", ModelPrice::new(0.0005, 0.0015)),
        ("text-embedding-3-small", ModelPrice::new(0.00002, 0.0)),
        ("qwen/qwen-2.5-72b-instruct", ModelPrice::new(0.0009, 0.0009)),
        ("qwen/qwen-2.5-7b-instruct", ModelPrice::new(0.0002, 0.0002)),
    ]
    .into_iter()
    .map(|(model, price)| (model.to_string(), price))
    .collect()
}

/// Role instructions sent with every generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// What the explored conversations should achieve; shown to mutator and critic
    #[serde(default = "default_goal")]
    pub goal: String,

    #[serde(default = "default_mutator_system")]
    pub mutator_system: String,

    #[serde(default = "default_persona_system")]
    pub persona_system: String,

    #[serde(default = "default_critic_system")]
    pub critic_system: String,

    /// Speaker label for prompts in transcripts
    #[serde(default = "default_human_label")]
    pub human_label: String,

    /// Speaker label for replies in transcripts
    #[serde(default = "default_agent_label")]
    pub agent_label: String,
}

fn default_goal() -> String {
    "Help the other person move from guarded small talk to openly discussing what is actually on their mind."
        .to_string()
}

fn default_mutator_system() -> String {
    "You write the next message in an ongoing conversation. Keep it natural and concise. \
     Output only the message itself, with no quotes or commentary."
        .to_string()
}

fn default_persona_system() -> String {
    "You are Alex, 32, anxious about work, a perfectionist who deflects with humor. \
     Reply naturally in one or two sentences. No stage directions."
        .to_string()
}

fn default_critic_system() -> String {
    "You evaluate whole conversations against a goal. Judge the trajectory, not single lines. \
     Respond with a JSON object {\"analysis\": string, \"score\": number between 0 and 1}."
        .to_string()
}

fn default_human_label() -> String {
    "Human".to_string()
}

fn default_agent_label() -> String {
    "Agent".to_string()
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            goal: default_goal(),
            mutator_system: default_mutator_system(),
            persona_system: default_persona_system(),
            critic_system: default_critic_system(),
            human_label: default_human_label(),
            agent_label: default_agent_label(),
        }
    }
}

/// `[provider]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Inline key; prefer `api_key_env`
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_chat_model")]
    pub mutator_model: String,

    #[serde(default = "default_chat_model")]
    pub persona_model: String,

    #[serde(default = "default_chat_model")]
    pub critic_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_true")]
    pub moderation_enabled: bool,

    #[serde(default = "default_moderation_model")]
    pub moderation_model: String,

    #[serde(default = "default_mutator_temperature")]
    pub mutator_temperature: f32,

    #[serde(default = "default_persona_temperature")]
    pub persona_temperature: f32,

    #[serde(default)]
    pub critic_temperature: f32,

    /// Approximate prompt budget per call; one token is counted as 4 chars
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Per-model prices; unknown models use `fallback_price`
    #[serde(default = "default_pricing")]
    pub pricing: HashMap<String, ModelPrice>,

    #[serde(default = "default_fallback_price")]
    pub fallback_price: ModelPrice,

    #[serde(default)]
    pub prompts: PromptConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_moderation_model() -> String {
    "omni-moderation-latest".to_string()
}

fn default_true() -> bool {
    true
}

fn default_mutator_temperature() -> f32 {
    0.9
}

fn default_persona_temperature() -> f32 {
    0.15
}

fn default_max_prompt_tokens() -> usize {
    512
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_fallback_price() -> ModelPrice {
    ModelPrice::new(0.0005, 0.0015)
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            mutator_model: default_chat_model(),
            persona_model: default_chat_model(),
            critic_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            moderation_enabled: default_true(),
            moderation_model: default_moderation_model(),
            mutator_temperature: default_mutator_temperature(),
            persona_temperature: default_persona_temperature(),
            critic_temperature: 0.0,
            max_prompt_tokens: default_max_prompt_tokens(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            pricing: default_pricing(),
            fallback_price: default_fallback_price(),
            prompts: PromptConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!("base_url must be an http(s) URL, got '{}'", self.base_url));
        }
        for (name, model) in [
            ("mutator_model", &self.mutator_model),
            ("persona_model", &self.persona_model),
            ("critic_model", &self.critic_model),
            ("embedding_model", &self.embedding_model),
        ] {
            if model.trim().is_empty() {
                return Err(format!("{} cannot be empty", name));
            }
        }
        if self.max_prompt_tokens == 0 {
            return Err("max_prompt_tokens must be positive".to_string());
        }
        let prices = self.pricing.values().chain(std::iter::once(&self.fallback_price));
        for price in prices {
            let valid = |v: f64| v.is_finite() && v >= 0.0;
            if !valid(price.input_per_1k) || !valid(price.output_per_1k) {
                return Err("prices must be non-negative numbers".to_string());
            }
        }
        Ok(())
    }

    /// Inline key, else the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty()))
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.pricing
            .get(model)
            .copied()
            .unwrap_or(self.fallback_price)
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Per-call generation options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask for a JSON object response
    pub json_object: bool,
}

/// Keep messages in order until `max_chars` is used up. The message that
/// crosses the limit is cut and marked with "..." when more than 100 chars of
/// it fit; anything after it is dropped.
pub fn truncate_messages(messages: Vec<ChatMessage>, max_chars: usize) -> Vec<ChatMessage> {
    let mut kept = Vec::with_capacity(messages.len());
    let mut used = 0usize;
    for mut message in messages {
        let len = message.content.chars().count();
        if used + len <= max_chars {
            used += len;
            kept.push(message);
            continue;
        }
        let remaining = max_chars.saturating_sub(used);
        if remaining > 100 {
            debug!(from = len, to = remaining, "Truncating prompt message");
            message.content = message.content.chars().take(remaining).collect::<String>() + "...";
            kept.push(message);
        }
        break;
    }
    kept
}

// OpenAI-compatible wire types
#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: HashMap<String, bool>,
}

fn map_http_error(error: reqwest::Error) -> CapabilityError {
    if error.is_timeout() {
        CapabilityError::Timeout(error.to_string())
    } else if error.is_connect() {
        CapabilityError::Request(format!("Connection error: {}", error))
    } else if error.is_decode() {
        CapabilityError::InvalidResponse(format!("Failed to parse response: {}", error))
    } else {
        CapabilityError::Request(format!("HTTP error: {}", error))
    }
}

fn status_error(status: u16, body: &str) -> CapabilityError {
    match status {
        401 | 403 => CapabilityError::Auth(format!("Authentication failed: {}", body)),
        429 => CapabilityError::RateLimited(format!("Rate limit exceeded: {}", body)),
        408 | 504 => CapabilityError::Timeout(format!("Upstream timeout: {}", body)),
        500..=599 => CapabilityError::Request(format!("Server error {}: {}", status, body)),
        _ => CapabilityError::InvalidResponse(format!("Request failed ({}): {}", status, body)),
    }
}

fn build_provider_http_client(config: &ProviderConfig) -> Result<Client, CapabilityError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| CapabilityError::NotConfigured(format!("Failed to create HTTP client: {}", e)))
}

/// Client for an OpenAI-compatible API
pub struct OpenAiClient {
    client: Client,
    config: ProviderConfig,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: ProviderConfig) -> Result<Self, CapabilityError> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            CapabilityError::NotConfigured(format!(
                "No API key: set provider.api_key or ${}",
                config.api_key_env
            ))
        })?;
        let client = build_provider_http_client(&config)?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post<Req: Serialize + ?Sized, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, CapabilityError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(status_error(status.as_u16(), &error_text));
        }

        response.json().await.map_err(map_http_error)
    }

    /// One chat completion, priced with the model's entry in the table.
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<Metered<String>, CapabilityError> {
        let messages = truncate_messages(messages, self.config.max_prompt_tokens * 4);
        let request = ChatCompletionRequest {
            model,
            messages: &messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options
                .json_object
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let completion: ChatCompletionResponse = self.post("chat/completions", &request).await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CapabilityError::InvalidResponse("No choices in response".to_string()))?;

        let usage = completion.usage.unwrap_or_default();
        let usage = TokenUsage::new(usage.prompt_tokens, usage.completion_tokens);
        let cost = self.config.price_for(model).cost(&usage);
        info!(
            model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost_usd = cost,
            "Chat completion"
        );
        Ok(Metered::new(content, cost, usage))
    }

    pub async fn embed(&self, text: &str) -> Result<Metered<Embedding>, CapabilityError> {
        let model = self.config.embedding_model.as_str();
        let request = EmbeddingRequest { model, input: text };
        let response: EmbeddingResponse = self.post("embeddings", &request).await?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| CapabilityError::InvalidResponse("Empty embedding".to_string()))?;

        let usage = response.usage.unwrap_or_default();
        let usage = TokenUsage::new(usage.prompt_tokens, 0);
        let cost = self.config.price_for(model).cost(&usage);
        Ok(Metered::new(embedding, cost, usage))
    }

    /// Moderation calls are not billed.
    pub async fn moderate(&self, text: &str) -> Result<Metered<Verdict>, CapabilityError> {
        let request = ModerationRequest {
            model: &self.config.moderation_model,
            input: text,
        };
        let response: ModerationResponse = self.post("moderations", &request).await?;
        let result = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| CapabilityError::InvalidResponse("No moderation result".to_string()))?;

        let verdict = if result.flagged {
            let mut categories: Vec<String> = result
                .categories
                .into_iter()
                .filter_map(|(name, hit)| hit.then_some(name))
                .collect();
            categories.sort();
            Verdict::Blocked { categories }
        } else {
            Verdict::Allowed
        };
        Ok(Metered::free(verdict))
    }
}
