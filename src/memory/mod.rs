pub mod augmenter;
pub mod services;
pub mod types;

pub use augmenter::{Augmentation, AugmentationSettings, ContextAugmenter, MemoryServices};
pub use services::{EmbeddingProvider, MemoryStore, OpenAiEmbeddingClient, PineconeVectorStore, VectorStore};
pub use types::{Memory, QueryOptions, VectorMatch};
