use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{ChatMessage, ChatOptions, ChatResponse, FinishReason, ProviderId, TokenUsage};

/// An inbound chat request. Provider and model fall back to registry defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub provider: Option<ProviderId>,
    #[validate(length(min = 1))]
    pub model: Option<String>,
    #[validate(length(min = 1))]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    #[validate(nested)]
    pub options: ChatOptions,
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            provider: None,
            model: None,
            messages,
            options: ChatOptions::default(),
            conversation_id: None,
        }
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Wire events delivered to a streaming caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        usage: TokenUsage,
        provider: ProviderId,
        model: String,
        memories_used: usize,
        finish_reason: FinishReason,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        StreamEvent::Chunk {
            content: content.into(),
        }
    }

    pub fn done(response: &ChatResponse, memories_used: usize) -> Self {
        StreamEvent::Done {
            usage: response.usage,
            provider: response.provider,
            model: response.model.clone(),
            memories_used,
            finish_reason: response.finish_reason,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

/// Result of a non-streaming exchange, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    #[serde(flatten)]
    pub response: ChatResponse,
    pub memories_used: usize,
    pub fallback_used: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_wire_format() {
        let chunk = serde_json::to_value(StreamEvent::chunk("Hel")).unwrap();
        assert_eq!(chunk, serde_json::json!({ "type": "chunk", "content": "Hel" }));

        let done = serde_json::to_value(StreamEvent::Done {
            usage: TokenUsage::new(10, 3),
            provider: ProviderId::Anthropic,
            model: "claude-3-5-haiku-20241022".to_string(),
            memories_used: 2,
            finish_reason: FinishReason::Timeout,
        })
        .unwrap();
        assert_eq!(done["type"], "done");
        assert_eq!(done["usage"]["inputTokens"], 10);
        assert_eq!(done["usage"]["outputTokens"], 3);
        assert_eq!(done["provider"], "anthropic");
        assert_eq!(done["memoriesUsed"], 2);
        assert_eq!(done["finishReason"], "timeout");

        let error = serde_json::to_value(StreamEvent::error("boom")).unwrap();
        assert_eq!(error, serde_json::json!({ "type": "error", "error": "boom" }));
    }

    #[test]
    fn test_request_validation() {
        let empty = ChatRequest::new(Vec::new());
        assert!(empty.validate().is_err());

        let ok = ChatRequest::new(vec![ChatMessage::user("hi")]).with_model("gpt-4o");
        assert!(ok.validate().is_ok());

        let blank_model = ChatRequest::new(vec![ChatMessage::user("hi")]).with_model("");
        assert!(blank_model.validate().is_err());

        let bad_options = ChatRequest::new(vec![ChatMessage::user("hi")]).with_options(ChatOptions {
            max_tokens: Some(0),
            ..ChatOptions::default()
        });
        assert!(bad_options.validate().is_err());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: ChatRequest = serde_json::from_str(
            r#"{
                "provider": "openai",
                "messages": [{"role": "user", "content": "hi"}],
                "options": {"maxTokens": 64},
                "conversationId": "c-1"
            }"#,
        )
        .unwrap();
        assert_eq!(request.provider, Some(ProviderId::OpenAI));
        assert_eq!(request.options.max_tokens, Some(64));
        assert_eq!(request.conversation_id.as_deref(), Some("c-1"));
    }
}
