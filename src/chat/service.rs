use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::chat::orchestrator::{ChatOrchestrator, StreamFailure};
use crate::chat::stream::{event_channel, StreamSession};
use crate::chat::types::{ChatReply, ChatRequest, StreamEvent};
use crate::error::{Error, Result};
use crate::memory::ContextAugmenter;
use crate::models::{ChatResponse, FinishReason, ProviderId};
use crate::storage::{UsageEntry, UsageTracker};

/// Configuration for the chat service
#[derive(Debug, Clone)]
pub struct ChatServiceConfig {
    pub augment: bool,
    pub track_usage: bool,
    pub channel_capacity: usize,
}

impl Default for ChatServiceConfig {
    fn default() -> Self {
        Self {
            augment: true,
            track_usage: true,
            channel_capacity: 64,
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    streams: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatServiceStatistics {
    pub requests: u64,
    pub streams: u64,
    pub failures: u64,
    pub fallbacks: u64,
    pub timeouts: u64,
    pub usage_failures: u64,
}

/// Entry point for callers: augments the conversation, routes it to a vendor
/// and accounts for usage in the background.
#[derive(Clone)]
pub struct ChatService {
    augmenter: Arc<ContextAugmenter>,
    orchestrator: Arc<ChatOrchestrator>,
    tracker: UsageTracker,
    config: ChatServiceConfig,
    counters: Arc<Counters>,
}

impl ChatService {
    pub fn new(
        augmenter: Arc<ContextAugmenter>,
        orchestrator: Arc<ChatOrchestrator>,
        tracker: UsageTracker,
        config: ChatServiceConfig,
    ) -> Self {
        info!("Initializing chat service");
        Self {
            augmenter,
            orchestrator,
            tracker,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ChatOrchestrator> {
        &self.orchestrator
    }

    /// One-shot chat against the requested (or default) provider.
    pub async fn send_message(&self, user_id: &str, request: ChatRequest) -> Result<ChatReply> {
        self.exchange(user_id, request, None).await
    }

    /// One-shot chat with a single fallback attempt on vendor failure.
    pub async fn send_message_with_fallback(
        &self,
        user_id: &str,
        request: ChatRequest,
        fallback: Option<ProviderId>,
    ) -> Result<ChatReply> {
        self.exchange(user_id, request, Some(fallback)).await
    }

    async fn exchange(
        &self,
        user_id: &str,
        mut request: ChatRequest,
        fallback: Option<Option<ProviderId>>,
    ) -> Result<ChatReply> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        request.validate()?;

        let memories_used = self.augment(user_id, &mut request).await;
        let primary = self.orchestrator.primary_provider(&request);

        let result = match fallback {
            Some(fallback) => self.orchestrator.chat_with_fallback(&request, fallback).await,
            None => self.orchestrator.chat(&request).await,
        };

        let response = result.map_err(|e| {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Chat request for user {} failed: {}", user_id, e);
            e
        })?;

        let fallback_used = response.provider != primary;
        if fallback_used {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        self.track(user_id, request.conversation_id.clone(), &response, memories_used);
        Ok(ChatReply {
            response,
            memories_used,
            fallback_used,
        })
    }

    /// Starts a streaming exchange and returns the event receiver. The
    /// stream always ends with exactly one `done` or `error` event, unless
    /// the receiver is dropped first.
    pub fn stream_message(&self, user_id: &str, request: ChatRequest) -> mpsc::Receiver<StreamEvent> {
        self.counters.streams.fetch_add(1, Ordering::Relaxed);
        let (sink, receiver) = event_channel(self.config.channel_capacity);
        let service = self.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            let mut session = StreamSession::new(sink);
            service.run_stream(&mut session, &user_id, request).await;
        });

        receiver
    }

    async fn run_stream(&self, session: &mut StreamSession, user_id: &str, mut request: ChatRequest) {
        if let Err(e) = request.validate() {
            session.fail(&Error::from(e)).await;
            return;
        }

        let primary = self.orchestrator.primary_provider(&request);
        if !self.orchestrator.registry().is_configured(primary) {
            session.fail(&Error::ProviderNotConfigured { provider: primary }).await;
            return;
        }

        session.begin_augmenting();
        let memories_used = self.augment(user_id, &mut request).await;

        if !session.sink().client_connected() {
            debug!("Client left before streaming started, skipping provider call");
            session.cancel().await;
            return;
        }

        session.begin_streaming();
        match self.orchestrator.stream_chat(&request, session.sink()).await {
            Ok(response) => {
                if response.finish_reason == FinishReason::Timeout {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                session.complete(&response, memories_used).await;
                self.track(user_id, request.conversation_id.clone(), &response, memories_used);
            }
            Err(StreamFailure { error, partial }) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Stream for user {} failed: {}", user_id, error);
                session.fail(&error).await;
                if let Some(partial) = partial.filter(|p| !p.content.is_empty()) {
                    self.track(user_id, request.conversation_id.clone(), &partial, memories_used);
                }
            }
        }
    }

    async fn augment(&self, user_id: &str, request: &mut ChatRequest) -> usize {
        if !self.config.augment {
            return 0;
        }
        let augmentation = self.augmenter.augment(user_id, &request.messages).await;
        let memories_used = augmentation.memories_used();
        request.messages = augmentation.messages;
        memories_used
    }

    fn track(&self, user_id: &str, conversation_id: Option<String>, response: &ChatResponse, memories_used: usize) {
        if !self.config.track_usage {
            return;
        }
        let entry = UsageEntry::from_response(user_id, conversation_id, response, memories_used);
        drop(self.tracker.submit(entry));
    }

    /// Waits for background usage writes so they survive process exit.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        debug!("Flushing {} pending usage records", self.tracker.pending());
        self.tracker.flush(limit).await
    }

    pub fn get_statistics(&self) -> ChatServiceStatistics {
        let c = &self.counters;
        ChatServiceStatistics {
            requests: c.requests.load(Ordering::Relaxed),
            streams: c.streams.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            usage_failures: self.tracker.failure_count(),
        }
    }
}
