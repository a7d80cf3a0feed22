use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::config::AugmentationConfig;
use crate::chat::deadline::{race_with_deadline, RaceError};
use crate::error::{Error, Result};
use crate::memory::services::{EmbeddingProvider, MemoryStore, VectorStore};
use crate::memory::types::{Memory, QueryOptions};
use crate::models::{ChatMessage, MessageRole};

/// The three collaborators needed to look memories up.
#[derive(Clone)]
pub struct MemoryServices {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vector_store: Arc<dyn VectorStore>,
    pub memory_store: Arc<dyn MemoryStore>,
}

#[derive(Debug, Clone)]
pub struct AugmentationSettings {
    pub timeout: Duration,
    pub top_k: usize,
    pub min_score: f32,
    pub context_turns: usize,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self::from(&AugmentationConfig::default())
    }
}

impl From<&AugmentationConfig> for AugmentationSettings {
    fn from(config: &AugmentationConfig) -> Self {
        Self {
            timeout: config.timeout(),
            top_k: config.top_k,
            min_score: config.min_score,
            context_turns: config.context_turns,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Augmentation {
    pub messages: Vec<ChatMessage>,
    pub memories: Vec<Memory>,
}

impl Augmentation {
    fn unchanged(messages: &[ChatMessage]) -> Self {
        Self {
            messages: messages.to_vec(),
            memories: Vec::new(),
        }
    }

    pub fn memories_used(&self) -> usize {
        self.memories.len()
    }
}

/// Enriches a conversation with relevant user memories before it goes to a
/// vendor. Retrieval is bounded by a hard deadline and can never fail the chat.
pub struct ContextAugmenter {
    services: Option<MemoryServices>,
    settings: AugmentationSettings,
}

impl ContextAugmenter {
    pub fn new(services: Option<MemoryServices>, settings: AugmentationSettings) -> Self {
        Self { services, settings }
    }

    pub fn disabled() -> Self {
        Self::new(None, AugmentationSettings::default())
    }

    pub fn is_configured(&self) -> bool {
        self.services.is_some()
    }

    /// Returns the messages with a memory context message prepended, or the
    /// original messages when nothing relevant was found in time.
    pub async fn augment(&self, user_id: &str, messages: &[ChatMessage]) -> Augmentation {
        match self.retrieve(user_id, messages).await {
            Ok(memories) if memories.is_empty() => Augmentation::unchanged(messages),
            Ok(memories) => {
                info!("Augmenting request with {} memories", memories.len());
                let mut augmented = Vec::with_capacity(messages.len() + 1);
                augmented.push(ChatMessage::system(format_memories(&memories)));
                augmented.extend_from_slice(messages);
                Augmentation {
                    messages: augmented,
                    memories,
                }
            }
            Err(e) => {
                warn!("Continuing without memories: {}", e);
                Augmentation::unchanged(messages)
            }
        }
    }

    /// Finds relevant memories within the retrieval deadline.
    ///
    /// Unconfigured services yield an empty list without waiting.
    pub async fn retrieve(&self, user_id: &str, messages: &[ChatMessage]) -> Result<Vec<Memory>> {
        let Some(services) = self.services.clone() else {
            debug!("Memory services not configured, skipping retrieval");
            return Ok(Vec::new());
        };

        let query = build_query_text(messages, self.settings.context_turns);
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let options = QueryOptions::for_user(user_id, self.settings.top_k, self.settings.min_score);
        let user_id = user_id.to_string();

        match race_with_deadline(
            self.settings.timeout,
            fetch_memories(services, user_id, query, options),
        )
        .await
        {
            Ok(result) => result,
            Err(RaceError::Expired(limit)) => Err(Error::AugmentationTimeout {
                timeout_ms: limit.as_millis() as u64,
            }),
            Err(RaceError::Aborted(reason)) => Err(Error::augmentation_unavailable(reason)),
        }
    }
}

async fn fetch_memories(
    services: MemoryServices,
    user_id: String,
    query: String,
    options: QueryOptions,
) -> Result<Vec<Memory>> {
    let embedding = services.embedder.embed(&query).await?;
    let matches = services.vector_store.query(&embedding, &options).await?;
    debug!("Vector store returned {} matches", matches.len());

    let mut memories = Vec::with_capacity(matches.len());
    for hit in matches.iter().filter(|m| m.score >= options.min_score) {
        let memory_id = hit
            .metadata
            .get("memoryId")
            .and_then(|v| v.as_str())
            .unwrap_or(hit.id.as_str());
        match services.memory_store.get_by_id(memory_id, &user_id).await? {
            Some(memory) => memories.push(memory),
            None => debug!("Vector {} has no backing memory, skipping", hit.id),
        }
    }
    Ok(memories)
}

/// Concatenates the content of the last `turns` user/assistant messages.
pub fn build_query_text(messages: &[ChatMessage], turns: usize) -> String {
    let recent: Vec<&str> = messages
        .iter()
        .rev()
        .filter(|m| m.role != MessageRole::System)
        .take(turns)
        .map(|m| m.content.as_str())
        .collect();

    recent.into_iter().rev().collect::<Vec<_>>().join("\n")
}

/// Renders memories as a numbered context block.
pub fn format_memories(memories: &[Memory]) -> String {
    let mut block = String::from("Relevant context from the user's saved memories:\n");
    for (index, memory) in memories.iter().enumerate() {
        block.push_str(&format!("\n{}. {}\n{}\n", index + 1, memory.title, memory.content));
    }
    block
}
