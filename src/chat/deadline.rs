use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RaceError {
    #[error("deadline of {0:?} expired")]
    Expired(Duration),
    #[error("task ended abnormally: {0}")]
    Aborted(String),
}

/// Aborts the wrapped task when dropped, so a caller that goes away
/// takes its background work with it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `task` on its own Tokio task and races it against a `limit` timer.
///
/// Whichever side loses is cancelled: an expired task is aborted before this
/// returns, and a timer is simply dropped. The task is also aborted if the
/// returned future is dropped before either side finishes.
pub async fn race_with_deadline<F>(limit: Duration, task: F) -> Result<F::Output, RaceError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut guard = AbortOnDrop(tokio::spawn(task));

    tokio::select! {
        joined = &mut guard.0 => joined.map_err(|e| RaceError::Aborted(e.to_string())),
        _ = tokio::time::sleep(limit) => {
            guard.0.abort();
            debug!("Deadline of {:?} expired, background task aborted", limit);
            Err(RaceError::Expired(limit))
        }
    }
}
