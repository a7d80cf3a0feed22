pub mod deadline;
pub mod orchestrator;
pub mod service;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use deadline::{race_with_deadline, RaceError};
pub use orchestrator::{ChatOrchestrator, StreamFailure, DEFAULT_STREAM_TIMEOUT};
pub use service::{ChatService, ChatServiceConfig, ChatServiceStatistics};
pub use stream::{event_channel, EventSink, StreamSession, StreamState};
pub use types::{ChatReply, ChatRequest, StreamEvent};
