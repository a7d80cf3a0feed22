//! Scripted provider adapters for orchestrator and service tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::error::{Error, Result};
use crate::models::{
    ChatMessage, ChatOptions, ChatResponse, DeltaStream, FinishReason, ProviderAdapter, ProviderId,
    StreamDelta, TokenUsage,
};

#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Usage(u32, u32),
    Wait(Duration),
    Fail(&'static str),
}

pub struct ScriptedAdapter {
    id: ProviderId,
    reply: std::result::Result<&'static str, &'static str>,
    script: Vec<Step>,
    pub calls: AtomicUsize,
    pub deltas_pulled: Arc<AtomicUsize>,
}

impl ScriptedAdapter {
    pub fn replying(id: ProviderId, reply: &'static str) -> Arc<Self> {
        Arc::new(Self::new(id, Ok(reply), Vec::new()))
    }

    pub fn failing(id: ProviderId, message: &'static str) -> Arc<Self> {
        Arc::new(Self::new(id, Err(message), Vec::new()))
    }

    pub fn streaming(id: ProviderId, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self::new(id, Ok(""), script))
    }

    fn new(
        id: ProviderId,
        reply: std::result::Result<&'static str, &'static str>,
        script: Vec<Step>,
    ) -> Self {
        Self {
            id,
            reply,
            script,
            calls: AtomicUsize::new(0),
            deltas_pulled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply {
            Ok(content) => Ok(ChatResponse {
                content: content.to_string(),
                usage: TokenUsage::new(messages.len() as u32 * 10, 5),
                finish_reason: FinishReason::Stop,
                provider: self.id,
                model: model.to_string(),
                duration_ms: 0,
            }),
            Err(message) => Err(Error::upstream(self.id, message)),
        }
    }

    async fn stream_chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<DeltaStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Err(message) = self.reply {
            return Err(Error::upstream(self.id, message));
        }

        let id = self.id;
        let pulled = Arc::clone(&self.deltas_pulled);
        let steps = stream::iter(self.script.clone()).filter_map(move |step| {
            let pulled = Arc::clone(&pulled);
            async move {
                pulled.fetch_add(1, Ordering::SeqCst);
                match step {
                    Step::Text(text) => Some(Ok(StreamDelta::Text(text.to_string()))),
                    Step::Usage(input, output) => Some(Ok(StreamDelta::Usage {
                        input_tokens: Some(input),
                        output_tokens: Some(output),
                    })),
                    Step::Wait(delay) => {
                        tokio::time::sleep(delay).await;
                        None
                    }
                    Step::Fail(message) => Some(Err(Error::upstream(id, message))),
                }
            }
        });
        Ok(Box::pin(steps))
    }
}

/// `count` chunks of `"tok "` spaced `every` apart.
pub fn paced_chunks(count: usize, every: Duration) -> Vec<Step> {
    (0..count)
        .flat_map(|_| [Step::Wait(every), Step::Text("tok ")])
        .collect()
}
