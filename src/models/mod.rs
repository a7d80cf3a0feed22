pub mod anthropic;
pub mod openai;
pub mod pricing;
pub mod provider;
pub mod registry;
pub mod sse;

#[cfg(test)]
pub(crate) mod test_support;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAIAdapter;
pub use pricing::ModelPricing;
pub use provider::{
    estimate_tokens, ChatMessage, ChatOptions, ChatResponse, DeltaStream, FinishReason,
    MessageRole, ProviderAdapter, ProviderId, StreamAccumulator, StreamDelta, TokenUsage,
};
pub use registry::{ProviderDescriptor, ProviderRegistry, ProviderRegistryBuilder};
