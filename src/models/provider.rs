use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::pricing;

/// The closed set of vendors the orchestrator can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::Anthropic, ProviderId::OpenAI];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAI => "openai",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "Anthropic",
            ProviderId::OpenAI => "OpenAI",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ProviderId::Anthropic),
            "openai" => Ok(ProviderId::OpenAI),
            other => Err(Error::validation(format!("Unknown provider: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub provider: ProviderId,
    pub model: String,
    pub duration_ms: u64,
}

/// One normalized piece of a vendor stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    /// Counters as the vendor reports them; either side may arrive alone.
    Usage {
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    },
    Finish(Option<String>),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// Approximate token count used when a vendor never reports usage.
///
/// Roughly four characters per token; not token-accurate.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).min(u32::MAX as u64) as u32
}

/// Folds stream deltas into a final response.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    provider: ProviderId,
    model: String,
    content: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    prompt_estimate: u32,
    vendor_finish: Option<String>,
}

impl StreamAccumulator {
    pub fn new(provider: ProviderId, model: impl Into<String>, messages: &[ChatMessage]) -> Self {
        let prompt_estimate = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        Self {
            provider,
            model: model.into(),
            content: String::new(),
            input_tokens: None,
            output_tokens: None,
            prompt_estimate,
            vendor_finish: None,
        }
    }

    /// Applies a delta and returns the text to forward to the caller, if any.
    pub fn apply(&mut self, delta: StreamDelta) -> Option<String> {
        match delta {
            StreamDelta::Text(text) if text.is_empty() => None,
            StreamDelta::Text(text) => {
                self.content.push_str(&text);
                Some(text)
            }
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                if input_tokens.is_some() {
                    self.input_tokens = input_tokens;
                }
                if output_tokens.is_some() {
                    self.output_tokens = output_tokens;
                }
                None
            }
            StreamDelta::Finish(reason) => {
                self.vendor_finish = reason;
                None
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn vendor_finish(&self) -> Option<&str> {
        self.vendor_finish.as_deref()
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(self.prompt_estimate),
            output_tokens: self
                .output_tokens
                .unwrap_or_else(|| estimate_tokens(&self.content)),
        }
    }

    pub fn finish(self, finish_reason: FinishReason, duration_ms: u64) -> ChatResponse {
        let usage = self.usage();
        ChatResponse {
            content: self.content,
            usage,
            finish_reason,
            provider: self.provider,
            model: self.model,
            duration_ms,
        }
    }
}

/// Splits out system instructions: `options.system` first, then every
/// system-role message in order, joined by newlines.
pub fn split_system<'a>(
    messages: &'a [ChatMessage],
    options: &ChatOptions,
) -> (Option<String>, Vec<&'a ChatMessage>) {
    let mut system = Vec::new();
    if let Some(extra) = options.system.as_deref().filter(|s| !s.is_empty()) {
        system.push(extra);
    }

    let mut turns = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            MessageRole::System => system.push(message.content.as_str()),
            _ => turns.push(message),
        }
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n"))
    };
    (system, turns)
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse>;

    /// Opens a vendor stream. Deltas arrive in the order the vendor sent them.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<DeltaStream>;

    fn calculate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
        pricing::calculate_cost(self.id(), model, input_tokens, output_tokens)
    }

    fn list_models(&self) -> Vec<String> {
        pricing::models_for(self.id())
    }
}
