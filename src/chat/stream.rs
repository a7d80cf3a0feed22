use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chat::types::StreamEvent;
use crate::error::Error;
use crate::models::{ChatResponse, FinishReason};

/// Creates a bounded event channel for one streaming request.
pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSink {
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

/// Write side of a stream. Writes after the terminal event, or after the
/// caller went away, are dropped silently.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    terminated: Arc<AtomicBool>,
}

impl EventSink {
    /// Whether the receiving side is still attached.
    pub fn client_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether a chunk written now could still reach the caller.
    pub fn is_open(&self) -> bool {
        self.client_connected() && !self.terminated.load(Ordering::Acquire)
    }

    /// Forwards one chunk. Returns `false` if it was dropped.
    pub async fn send_chunk(&self, content: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(StreamEvent::Chunk { content }).await.is_ok()
    }

    /// Emits the terminal event. Only the first call has any effect; returns
    /// whether this call was the one that terminated the stream.
    pub async fn terminate(&self, event: StreamEvent) -> bool {
        debug_assert!(event.is_terminal());
        if self
            .terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Stream already terminated, dropping {:?}", event);
            return false;
        }

        if self.tx.send(event).await.is_err() {
            debug!("Client disconnected before the terminal event");
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Augmenting,
    ProviderStreaming,
    Completed,
    TimedOut,
    Errored,
    Closed,
}

impl StreamState {
    fn can_advance_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Init, Augmenting)
                | (Init, ProviderStreaming)
                | (Init, Errored)
                | (Augmenting, ProviderStreaming)
                | (Augmenting, Errored)
                | (ProviderStreaming, Completed)
                | (ProviderStreaming, TimedOut)
                | (ProviderStreaming, Errored)
                | (Completed, Closed)
                | (TimedOut, Closed)
                | (Errored, Closed)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Init => "INIT",
            StreamState::Augmenting => "AUGMENTING",
            StreamState::ProviderStreaming => "PROVIDER_STREAMING",
            StreamState::Completed => "COMPLETED",
            StreamState::TimedOut => "TIMED_OUT",
            StreamState::Errored => "ERRORED",
            StreamState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one streaming request. Every path ends in `Closed` having
/// emitted exactly one terminal event.
pub struct StreamSession {
    state: StreamState,
    sink: EventSink,
}

impl StreamSession {
    pub fn new(sink: EventSink) -> Self {
        Self {
            state: StreamState::Init,
            sink,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    fn advance(&mut self, next: StreamState) {
        if !self.state.can_advance_to(next) {
            warn!("Ignoring stream transition {} -> {}", self.state, next);
            return;
        }
        debug!("Stream state {} -> {}", self.state, next);
        self.state = next;
    }

    pub fn begin_augmenting(&mut self) {
        self.advance(StreamState::Augmenting);
    }

    pub fn begin_streaming(&mut self) {
        self.advance(StreamState::ProviderStreaming);
    }

    /// Emits `done` for a finished (possibly time-limited) response.
    pub async fn complete(&mut self, response: &ChatResponse, memories_used: usize) {
        let next = match response.finish_reason {
            FinishReason::Timeout => StreamState::TimedOut,
            _ => StreamState::Completed,
        };
        self.advance(next);
        self.sink.terminate(StreamEvent::done(response, memories_used)).await;
        self.advance(StreamState::Closed);
    }

    /// Ends a stream whose caller left before the vendor was contacted.
    pub async fn cancel(&mut self) {
        self.advance(StreamState::Errored);
        self.sink.terminate(StreamEvent::error("Request cancelled")).await;
        self.advance(StreamState::Closed);
    }

    /// Emits `error` with a message that is safe to show the caller.
    pub async fn fail(&mut self, error: &Error) {
        if !error.is_caller_visible() {
            warn!("Stream failed internally, reporting a generic error: {}", error);
        }
        self.advance(StreamState::Errored);
        self.sink.terminate(StreamEvent::error(error.public_message())).await;
        self.advance(StreamState::Closed);
    }
}
