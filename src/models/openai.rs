use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    split_system, ChatMessage, ChatOptions, ChatResponse, DeltaStream, FinishReason, MessageRole,
    ProviderAdapter, ProviderId, StreamDelta, TokenUsage,
};
use crate::models::sse::{self, SseEvent};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAIAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAIAdapter {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string(), Duration::from_secs(60))
    }

    pub fn with_base_url(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                warn!("Failed to create OpenAI HTTP client: {}", e);
                Error::upstream(ProviderId::OpenAI, "failed to create HTTP client")
            })?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| Error::upstream(ProviderId::OpenAI, "invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    /// System instructions travel as a single leading `system` message.
    fn convert_messages(&self, messages: &[ChatMessage], options: &ChatOptions) -> Vec<OpenAIMessage> {
        let (system, turns) = split_system(messages, options);
        let mut converted = Vec::with_capacity(turns.len() + 1);
        if let Some(system) = system {
            converted.push(OpenAIMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        converted.extend(turns.into_iter().map(|msg| OpenAIMessage {
            role: match msg.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            }
            .to_string(),
            content: msg.content.clone(),
        }));
        converted
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> OpenAIRequest {
        OpenAIRequest {
            model: model.to_string(),
            messages: self.convert_messages(messages, options),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: Some(stream),
            stream_options: stream.then_some(OpenAIStreamOptions { include_usage: true }),
        }
    }

    async fn send(&self, request: &OpenAIRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let headers = self.create_headers()?;

        debug!(
            "Sending request to OpenAI: model={}, messages={}",
            request.model,
            request.messages.len()
        );

        let streaming = request.stream == Some(true);
        let mut builder = self.client.post(&url).headers(headers).json(request);
        if !streaming {
            builder = builder.timeout(self.timeout);
        }

        let start_time = Instant::now();
        let response = builder.send().await.map_err(|e| {
            warn!("OpenAI HTTP request failed: {}", e);
            let message = if e.is_timeout() {
                "request timed out"
            } else {
                "request failed"
            };
            Error::upstream(ProviderId::OpenAI, message)
        })?;
        debug!("OpenAI responded in {:?}", start_time.elapsed());

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: {} - {}", status, error_text);
            return Err(Error::upstream(ProviderId::OpenAI, format!("API error {}", status)));
        }

        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAI
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
            warn!("Failed to read OpenAI response: {}", e);
            Error::upstream(ProviderId::OpenAI, "malformed response")
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

        let deltas = sse::decode_events(response.bytes_stream(), ProviderId::OpenAI).flat_map(|event| {
            let items: Vec<Result<StreamDelta>> = match event {
                Ok(SseEvent::Data(data)) => match parse_stream_chunk(&data) {
                    Ok(deltas) => deltas.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Ok(SseEvent::Done) => Vec::new(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        });
        Ok(Box::pin(deltas))
    }
}

/// Builds a response from a chat-completions body. The response is tagged
/// with the requested model: OpenAI answers with a dated snapshot name
/// (`gpt-4o-mini-2024-07-18`) that the price table does not list.
pub(crate) fn parse_chat_response(model: &str, body: &str, duration_ms: u64) -> Result<ChatResponse> {
    let response: OpenAIResponse = serde_json::from_str(body).map_err(|e| {
        warn!("Failed to parse OpenAI response: {}", e);
        Error::upstream(ProviderId::OpenAI, "malformed response")
    })?;
    debug!(
        "Received response from OpenAI: id={}, model={}",
        response.id, response.model
    );

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::upstream(ProviderId::OpenAI, "no choices in response"))?;
    let usage = response
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        usage,
        finish_reason: FinishReason::Stop,
        provider: ProviderId::OpenAI,
        model: model.to_string(),
        duration_ms,
    })
}

/// Maps one chat-completions chunk onto normalized deltas. With
/// `include_usage`, counters only show up on a final chunk with no choices.
pub(crate) fn parse_stream_chunk(data: &str) -> Result<Vec<StreamDelta>> {
    let chunk: OpenAIStreamResponse = serde_json::from_str(data).map_err(|e| {
        warn!("Failed to parse OpenAI stream chunk: {} (data: {})", e, data);
        Error::upstream(ProviderId::OpenAI, "malformed stream chunk")
    })?;

    let mut deltas = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.content {
            deltas.push(StreamDelta::Text(content));
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(StreamDelta::Finish(Some(reason)));
        }
    }
    if let Some(usage) = chunk.usage {
        deltas.push(StreamDelta::Usage {
            input_tokens: Some(usage.prompt_tokens),
            output_tokens: Some(usage.completion_tokens),
        });
    }
    Ok(deltas)
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAIStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAIStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::serve_json_once;
    use rust_decimal::Decimal;

    const SNAPSHOT_BODY: &str = r#"{
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o-mini-2024-07-18",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi there"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 1000000, "completion_tokens": 1000000, "total_tokens": 2000000}
    }"#;

    #[test]
    fn test_chat_response_keeps_requested_model() {
        let response = parse_chat_response("gpt-4o-mini", SNAPSHOT_BODY, 12).unwrap();
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(response.content, "Hi there");
        assert_eq!(response.usage, TokenUsage::new(1_000_000, 1_000_000));
        assert_eq!(response.duration_ms, 12);

        assert!(parse_chat_response("gpt-4o-mini", r#"{"id":"x","model":"m","choices":[]}"#, 0).is_err());
        assert!(parse_chat_response("gpt-4o-mini", "<html>", 0).is_err());
    }

    #[tokio::test]
    async fn test_chat_against_snapshot_model_is_priced() {
        let (base_url, server) = serve_json_once(SNAPSHOT_BODY).await;
        let adapter =
            OpenAIAdapter::with_base_url("test-key".to_string(), base_url, Duration::from_secs(5)).unwrap();

        let response = adapter
            .chat("gpt-4o-mini", &[ChatMessage::user("Hello")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.model, "gpt-4o-mini");

        // 1M input at $0.15 + 1M output at $0.60
        let cost = adapter.calculate_cost(&response.model, response.usage.input_tokens, response.usage.output_tokens);
        assert_eq!(cost, Decimal::new(75, 2));

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["model"], "gpt-4o-mini");
        assert_eq!(sent["stream"], false);
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = OpenAIAdapter::new("test-key".to_string()).unwrap();
        assert_eq!(adapter.id(), ProviderId::OpenAI);
        assert!(adapter.list_models().contains(&"gpt-4o".to_string()));
    }

    #[test]
    fn test_message_conversion_keeps_single_leading_system() {
        let adapter = OpenAIAdapter::new("test-key".to_string()).unwrap();
        let messages = vec![
            ChatMessage::system("You are a helpful assistant"),
            ChatMessage::user("Hello"),
            ChatMessage::system("Relevant memories: none"),
        ];
        let options = ChatOptions::default();

        let converted = adapter.convert_messages(&messages, &options);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[0].content, "You are a helpful assistant\nRelevant memories: none");
        assert_eq!(converted[1].role, "user");
    }

    #[test]
    fn test_streaming_request_asks_for_usage() {
        let adapter = OpenAIAdapter::new("test-key".to_string()).unwrap();
        let request = adapter.build_request("gpt-4o", &[ChatMessage::user("hi")], &ChatOptions::default(), true);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);

        let request = adapter.build_request("gpt-4o", &[ChatMessage::user("hi")], &ChatOptions::default(), false);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("stream_options").is_none());
    }

    #[test]
    fn test_parse_stream_chunks() {
        let text = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(parse_stream_chunk(text).unwrap(), vec![StreamDelta::Text("Hel".into())]);

        let finish = r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_stream_chunk(finish).unwrap(), vec![StreamDelta::Finish(Some("stop".into()))]);

        let usage = r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":9,"completion_tokens":12,"total_tokens":21}}"#;
        assert_eq!(
            parse_stream_chunk(usage).unwrap(),
            vec![StreamDelta::Usage { input_tokens: Some(9), output_tokens: Some(12) }]
        );

        assert!(parse_stream_chunk("not json").is_err());
    }
}
