use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::chat::stream::EventSink;
use crate::chat::types::ChatRequest;
use crate::error::{Error, Result};
use crate::models::{
    ChatResponse, FinishReason, ProviderAdapter, ProviderId, ProviderRegistry, StreamAccumulator,
};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_millis(60_000);

/// A streaming request that ended in an error, with whatever was generated
/// before it failed.
#[derive(Debug)]
pub struct StreamFailure {
    pub error: Error,
    pub partial: Option<ChatResponse>,
}

impl From<Error> for StreamFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

struct Target {
    provider: ProviderId,
    model: String,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Routes requests to vendor adapters: default resolution, a single
/// fallback attempt for one-shot chats, and the streaming deadline.
pub struct ChatOrchestrator {
    registry: Arc<ProviderRegistry>,
    stream_timeout: Duration,
}

impl ChatOrchestrator {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self::with_stream_timeout(registry, DEFAULT_STREAM_TIMEOUT)
    }

    pub fn with_stream_timeout(registry: Arc<ProviderRegistry>, stream_timeout: Duration) -> Self {
        Self {
            registry,
            stream_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The provider a request will go to before any fallback.
    pub fn primary_provider(&self, request: &ChatRequest) -> ProviderId {
        request
            .provider
            .or_else(|| self.registry.default_provider())
            .unwrap_or(ProviderId::ALL[0])
    }

    fn resolve(&self, request: &ChatRequest) -> Result<Target> {
        let provider = self.primary_provider(request);
        // Fails before any network traffic when credentials are missing.
        let adapter = self.registry.resolve_adapter(provider)?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.registry.get_default_model(provider));
        Ok(Target {
            provider,
            model,
            adapter,
        })
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        request.validate()?;
        let target = self.resolve(request)?;
        debug!("Chat request to {} ({})", target.provider, target.model);

        let started = Instant::now();
        let mut response = target
            .adapter
            .chat(&target.model, &request.messages, &request.options)
            .await?;
        response.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Chat completed by {} ({}) in {}ms",
            response.provider, response.model, response.duration_ms
        );
        Ok(response)
    }

    /// Tries the primary provider, then at most one other provider.
    ///
    /// `fallback` wins when given and distinct from the primary; otherwise the
    /// next configured provider by priority is used. The fallback's error is
    /// the one returned when both attempts fail.
    pub async fn chat_with_fallback(
        &self,
        request: &ChatRequest,
        fallback: Option<ProviderId>,
    ) -> Result<ChatResponse> {
        let primary = self.primary_provider(request);

        let primary_error = match self.chat(request).await {
            Ok(response) => return Ok(response),
            Err(e @ (Error::Upstream(_) | Error::ProviderNotConfigured { .. })) => e,
            Err(e) => return Err(e),
        };

        let fallback_provider = fallback
            .filter(|candidate| *candidate != primary)
            .or_else(|| self.registry.next_available(primary));
        let Some(fallback_provider) = fallback_provider else {
            debug!("No fallback provider available for {}", primary);
            return Err(primary_error);
        };

        warn!(
            "Provider {} failed ({}), falling back to {}",
            primary, primary_error, fallback_provider
        );

        let model = match &request.model {
            Some(model)
                if self
                    .registry
                    .descriptor(fallback_provider)
                    .is_some_and(|d| d.supports_model(model)) =>
            {
                model.clone()
            }
            _ => self.registry.get_default_model(fallback_provider),
        };

        let fallback_request = ChatRequest {
            provider: Some(fallback_provider),
            model: Some(model),
            ..request.clone()
        };
        self.chat(&fallback_request).await
    }

    /// Streams one response into `sink`. No fallback is attempted.
    ///
    /// The deadline covers opening the vendor stream and reading it; when it
    /// passes, the vendor stream is dropped and the text so far is returned
    /// with `FinishReason::Timeout`. A departed client ends the read early
    /// with whatever was produced.
    pub async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: &EventSink,
    ) -> std::result::Result<ChatResponse, StreamFailure> {
        request.validate().map_err(Error::from)?;
        let target = self.resolve(request)?;
        debug!("Streaming request to {} ({})", target.provider, target.model);

        let started = Instant::now();
        let deadline = started + self.stream_timeout;
        let mut acc = StreamAccumulator::new(target.provider, target.model.clone(), &request.messages);
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let opened = tokio::time::timeout_at(
            deadline,
            target
                .adapter
                .stream_chat(&target.model, &request.messages, &request.options),
        )
        .await;
        let mut deltas = match opened {
            Ok(Ok(deltas)) => deltas,
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => {
                warn!("{} did not open a stream within {:?}", target.provider, self.stream_timeout);
                return Ok(acc.finish(FinishReason::Timeout, elapsed_ms()));
            }
        };

        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        let finish_reason = loop {
            if !sink.client_connected() {
                info!("Client disconnected, abandoning {} stream", target.provider);
                break FinishReason::Stop;
            }

            tokio::select! {
                biased;
                _ = &mut expiry => {
                    warn!("Stream from {} hit the {:?} deadline", target.provider, self.stream_timeout);
                    break FinishReason::Timeout;
                }
                next = deltas.next() => match next {
                    None => break FinishReason::Stop,
                    Some(Ok(delta)) => {
                        let Some(text) = acc.apply(delta) else { continue };
                        match tokio::time::timeout_at(deadline, sink.send_chunk(text)).await {
                            Ok(true) => {}
                            Ok(false) => {
                                info!("Client disconnected, abandoning {} stream", target.provider);
                                break FinishReason::Stop;
                            }
                            Err(_) => break FinishReason::Timeout,
                        }
                    }
                    Some(Err(error)) => {
                        drop(deltas);
                        warn!(
                            "Stream from {} failed after {} chars: {}",
                            target.provider,
                            acc.content().len(),
                            error
                        );
                        return Err(StreamFailure {
                            error,
                            partial: Some(acc.finish(FinishReason::Error, elapsed_ms())),
                        });
                    }
                }
            }
        };

        // Dropping the vendor stream cancels the underlying request.
        drop(deltas);
        if let Some(reason) = acc.vendor_finish() {
            debug!("{} reported finish reason {}", target.provider, reason);
        }
        Ok(acc.finish(finish_reason, elapsed_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::stream::event_channel;
    use crate::chat::test_support::{paced_chunks, ScriptedAdapter, Step};
    use crate::chat::types::StreamEvent;
    use crate::models::ChatMessage;

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("Tell me something")])
    }

    fn registry_of(adapters: Vec<Arc<ScriptedAdapter>>) -> Arc<ProviderRegistry> {
        let mut builder = ProviderRegistry::builder();
        for adapter in adapters {
            builder = builder.register(adapter);
        }
        Arc::new(builder.build())
    }

    #[tokio::test]
    async fn test_defaults_resolve_to_first_provider() {
        let openai = ScriptedAdapter::replying(ProviderId::OpenAI, "hello");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai.clone()]));

        let response = orchestrator.chat(&request()).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.provider, ProviderId::OpenAI);
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_makes_no_upstream_call() {
        let openai = ScriptedAdapter::replying(ProviderId::OpenAI, "hello");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai.clone()]));

        let err = orchestrator
            .chat(&request().with_provider(ProviderId::Anthropic))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProviderNotConfigured {
                provider: ProviderId::Anthropic
            }
        ));
        assert_eq!(openai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_resolution() {
        let openai = ScriptedAdapter::replying(ProviderId::OpenAI, "hello");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai.clone()]));

        let err = orchestrator.chat(&ChatRequest::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(openai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_to_configured_provider() {
        let anthropic = ScriptedAdapter::replying(ProviderId::Anthropic, "from claude");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![anthropic.clone()]));

        let response = orchestrator
            .chat_with_fallback(
                &request().with_provider(ProviderId::OpenAI).with_model("gpt-4o"),
                Some(ProviderId::Anthropic),
            )
            .await
            .unwrap();
        assert_eq!(response.provider, ProviderId::Anthropic);
        assert_eq!(response.model, "claude-3-5-sonnet-20241022");
        assert_eq!(anthropic.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_makes_at_most_two_attempts() {
        let openai = ScriptedAdapter::failing(ProviderId::OpenAI, "primary down");
        let anthropic = ScriptedAdapter::failing(ProviderId::Anthropic, "fallback down");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai.clone(), anthropic.clone()]));

        let err = orchestrator.chat_with_fallback(&request(), None).await.unwrap_err();
        match err {
            Error::Upstream(e) => {
                assert_eq!(e.provider, ProviderId::Anthropic);
                assert_eq!(e.message, "fallback down");
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
        assert_eq!(openai.call_count() + anthropic.call_count(), 2);
    }

    #[tokio::test]
    async fn test_explicit_fallback_equal_to_primary_uses_next_available() {
        let openai = ScriptedAdapter::failing(ProviderId::OpenAI, "primary down");
        let anthropic = ScriptedAdapter::replying(ProviderId::Anthropic, "rescued");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai.clone(), anthropic.clone()]));

        let response = orchestrator
            .chat_with_fallback(&request(), Some(ProviderId::OpenAI))
            .await
            .unwrap();
        assert_eq!(response.provider, ProviderId::Anthropic);
        assert_eq!(openai.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_fallback_available_surfaces_primary_error() {
        let openai = ScriptedAdapter::failing(ProviderId::OpenAI, "primary down");
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai.clone()]));

        let err = orchestrator.chat_with_fallback(&request(), None).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(ref e) if e.message == "primary down"));
        assert_eq!(openai.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_keeps_partial_content() {
        let openai = ScriptedAdapter::streaming(
            ProviderId::OpenAI,
            vec![
                Step::Text("one "),
                Step::Text("two "),
                Step::Text("three"),
                Step::Fail("connection reset"),
            ],
        );
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai]));
        let (sink, mut rx) = event_channel(16);

        let failure = orchestrator.stream_chat(&request(), &sink).await.unwrap_err();
        drop(sink);

        let partial = failure.partial.unwrap();
        assert_eq!(partial.content, "one two three");
        assert_eq!(partial.finish_reason, FinishReason::Error);
        assert!(matches!(failure.error, Error::Upstream(_)));

        let mut chunks = 0;
        while let Some(event) = rx.recv().await {
            assert!(matches!(event, StreamEvent::Chunk { .. }));
            chunks += 1;
        }
        assert_eq!(chunks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_deadline_returns_partial_with_timeout() {
        let openai = ScriptedAdapter::streaming(
            ProviderId::OpenAI,
            paced_chunks(120, Duration::from_secs(1)),
        );
        let pulled = Arc::clone(&openai.deltas_pulled);
        let orchestrator = ChatOrchestrator::new(registry_of(vec![openai]));
        let (sink, mut rx) = event_channel(256);
        let started = Instant::now();

        let response = orchestrator.stream_chat(&request(), &sink).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(response.finish_reason, FinishReason::Timeout);
        assert!(!response.content.is_empty());
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_millis(60_100));
        assert!(response.usage.output_tokens > 0);

        // The vendor stream is no longer read after the deadline.
        let pulled_at_deadline = pulled.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), pulled_at_deadline);

        drop(sink);
        let mut chunks = 0;
        while let Some(event) = rx.recv().await {
            assert!(matches!(event, StreamEvent::Chunk { .. }));
            chunks += 1;
        }
        assert!((59..=60).contains(&chunks));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_disconnect_stops_reading() {
        let openai = ScriptedAdapter::streaming(
            ProviderId::OpenAI,
            paced_chunks(50, Duration::from_millis(100)),
        );
        let pulled = Arc::clone(&openai.deltas_pulled);
        let orchestrator = Arc::new(ChatOrchestrator::new(registry_of(vec![openai])));
        let (sink, mut rx) = event_channel(4);

        let task = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.stream_chat(&request(), &sink).await })
        };

        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk { .. })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk { .. })));
        drop(rx);

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert!(response.content.starts_with("tok tok "));
        assert!(pulled.load(std::sync::atomic::Ordering::SeqCst) < 20);
    }

    #[tokio::test]
    async fn test_stream_to_unconfigured_provider_fails_without_partial() {
        let orchestrator = ChatOrchestrator::new(registry_of(Vec::new()));
        let (sink, _rx) = event_channel(4);

        let failure = orchestrator.stream_chat(&request(), &sink).await.unwrap_err();
        assert!(matches!(failure.error, Error::ProviderNotConfigured { .. }));
        assert!(failure.partial.is_none());
    }
}
