use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    split_system, ChatMessage, ChatOptions, ChatResponse, DeltaStream, FinishReason, MessageRole,
    ProviderAdapter, ProviderId, StreamDelta, TokenUsage,
};
use crate::models::sse::{self, SseEvent};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const EMPTY_TURN_PLACEHOLDER: &str = "Continue.";

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string(), Duration::from_secs(120))
    }

    pub fn with_base_url(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        // No client-wide timeout: it would also cut off long streams.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                warn!("Failed to create Anthropic HTTP client: {}", e);
                Error::upstream(ProviderId::Anthropic, "failed to create HTTP client")
            })?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> AnthropicRequest {
        let (system, turns) = split_system(messages, options);
        let mut anthropic_messages: Vec<AnthropicMessage> = turns
            .into_iter()
            .map(|message| AnthropicMessage {
                role: match message.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                }
                .to_string(),
                content: message.content.clone(),
            })
            .collect();

        // The Messages API rejects an empty turn list.
        if anthropic_messages.is_empty() {
            anthropic_messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: EMPTY_TURN_PLACEHOLDER.to_string(),
            });
        }

        AnthropicRequest {
            model: model.to_string(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: anthropic_messages,
            system,
            temperature: options.temperature,
            stream,
        }
    }

    async fn send(&self, request: &AnthropicRequest) -> Result<reqwest::Response> {
        debug!(
            "Making Anthropic API request: model={}, messages={}, stream={}",
            request.model,
            request.messages.len(),
            request.stream
        );

        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request);
        if !request.stream {
            builder = builder.timeout(self.timeout);
        }

        let response = builder.send().await.map_err(|e| {
            warn!("Anthropic request failed: {}", e);
            let message = if e.is_timeout() {
                "request timed out"
            } else {
                "request failed"
            };
            Error::upstream(ProviderId::Anthropic, message)
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        warn!("Anthropic API error: {} - {}", status, error_text);
        Err(Error::upstream(ProviderId::Anthropic, format!("API error {}", status)))
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let start_time = Instant::now();
        let request = self.build_request(model, messages, options, false);

        let body = self.send(&request).await?.text().await.map_err(|e| {
            warn!("Failed to read Anthropic response: {}", e);
            Error::upstream(ProviderId::Anthropic, "malformed response")
        })?;

        parse_chat_response(model, &body, start_time.elapsed().as_millis() as u64)
    }

    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<DeltaStream> {
        let request = self.build_request(model, messages, options, true);
        let response = self.send(&request).await?;

        let deltas = sse::decode_events(response.bytes_stream(), ProviderId::Anthropic).flat_map(
            |event| {
                let items: Vec<Result<StreamDelta>> = match event {
                    Ok(SseEvent::Data(data)) => match parse_stream_event(&data) {
                        Ok(deltas) => deltas.into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(e)],
                    },
                    Ok(SseEvent::Done) => Vec::new(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            },
        );
        Ok(Box::pin(deltas))
    }
}

/// Builds a response from a Messages API body, tagged with the requested
/// model so pricing matches the streaming path.
pub(crate) fn parse_chat_response(model: &str, body: &str, duration_ms: u64) -> Result<ChatResponse> {
    let response: AnthropicResponse = serde_json::from_str(body).map_err(|e| {
        warn!("Failed to parse Anthropic response: {}", e);
        Error::upstream(ProviderId::Anthropic, "malformed response")
    })?;
    debug!(
        "Received Anthropic response: id={}, model={}",
        response.id, response.model
    );

    let content = response
        .content
        .iter()
        .filter(|block| block.r#type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<String>();

    Ok(ChatResponse {
        content,
        usage: TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens),
        finish_reason: FinishReason::Stop,
        provider: ProviderId::Anthropic,
        model: model.to_string(),
        duration_ms,
    })
}

/// Maps one Messages API stream event onto normalized deltas.
///
/// Input tokens are announced on `message_start`; the final output count only
/// arrives on `message_delta`.
pub(crate) fn parse_stream_event(data: &str) -> Result<Vec<StreamDelta>> {
    let event: AnthropicStreamEvent = serde_json::from_str(data).map_err(|e| {
        warn!("Failed to parse Anthropic stream event: {} (data: {})", e, data);
        Error::upstream(ProviderId::Anthropic, "malformed stream event")
    })?;

    let deltas = match event {
        AnthropicStreamEvent::MessageStart { message } => vec![StreamDelta::Usage {
            input_tokens: message.usage.input_tokens,
            output_tokens: message.usage.output_tokens,
        }],
        AnthropicStreamEvent::ContentBlockDelta { delta } => match delta.text {
            Some(text) => vec![StreamDelta::Text(text)],
            None => Vec::new(),
        },
        AnthropicStreamEvent::MessageDelta { delta, usage } => {
            let mut deltas = Vec::new();
            if let Some(usage) = usage {
                deltas.push(StreamDelta::Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
            }
            if let Some(reason) = delta.stop_reason {
                deltas.push(StreamDelta::Finish(Some(reason)));
            }
            deltas
        }
        AnthropicStreamEvent::Error { error } => {
            warn!("Anthropic stream error event: {} - {}", error.r#type, error.message);
            return Err(Error::upstream(
                ProviderId::Anthropic,
                format!("stream error: {}", error.r#type),
            ));
        }
        AnthropicStreamEvent::Other => Vec::new(),
    };
    Ok(deltas)
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicContent>,
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicStreamUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockDelta {
        delta: AnthropicTextDelta,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
        usage: Option<AnthropicStreamUsage>,
    },
    Error {
        error: AnthropicErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    usage: AnthropicStreamUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicTextDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    r#type: String,
    message: String,
}
