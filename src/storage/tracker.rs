use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::models::{ChatResponse, ProviderId, ProviderRegistry, TokenUsage};
use crate::storage::usage::{new_record_id, PersistenceSink, UsageRecord};

/// Everything needed to account for one completed (or partial) request.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub provider: ProviderId,
    pub model: String,
    pub usage: TokenUsage,
    /// Precomputed cost; derived from the price table when absent.
    pub cost: Option<Decimal>,
    pub memories_used: u32,
    pub duration_ms: Option<u64>,
}

impl UsageEntry {
    pub fn from_response(
        user_id: impl Into<String>,
        conversation_id: Option<String>,
        response: &ChatResponse,
        memories_used: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id,
            provider: response.provider,
            model: response.model.clone(),
            usage: response.usage,
            cost: None,
            memories_used: memories_used as u32,
            duration_ms: Some(response.duration_ms),
        }
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by each submitted task; dropping it (on completion, panic or abort)
/// releases the slot.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn acquire(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Records usage off the response path. Cheap to clone.
#[derive(Clone)]
pub struct UsageTracker {
    registry: Arc<ProviderRegistry>,
    sink: Arc<dyn PersistenceSink>,
    failures: Arc<AtomicU64>,
    in_flight: Arc<InFlight>,
}

impl UsageTracker {
    pub fn new(registry: Arc<ProviderRegistry>, sink: Arc<dyn PersistenceSink>) -> Self {
        Self {
            registry,
            sink,
            failures: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Persists one usage record and, for conversations, bumps the running totals.
    pub async fn track_usage(&self, entry: UsageEntry) -> Result<UsageRecord> {
        let cost = entry.cost.unwrap_or_else(|| {
            self.registry.calculate_cost(
                entry.provider,
                &entry.model,
                entry.usage.input_tokens,
                entry.usage.output_tokens,
            )
        });

        let record = UsageRecord {
            id: new_record_id(),
            user_id: entry.user_id,
            conversation_id: entry.conversation_id,
            provider: entry.provider,
            model: entry.model,
            input_tokens: entry.usage.input_tokens,
            output_tokens: entry.usage.output_tokens,
            cost,
            memories_used: entry.memories_used,
            duration_ms: entry.duration_ms,
            timestamp: Utc::now(),
        };

        self.sink.record_usage(&record).await?;

        if let Some(conversation_id) = &record.conversation_id {
            self.sink
                .increment_conversation_totals(conversation_id, &record.user_id, record.total_tokens(), cost)
                .await?;
        }

        debug!(
            "Tracked usage {} for {}/{}: {} tokens, cost {}",
            record.id,
            record.provider,
            record.model,
            record.total_tokens(),
            record.cost
        );
        Ok(record)
    }

    /// Fire-and-forget variant; failures are logged and counted only.
    pub fn submit(&self, entry: UsageEntry) -> JoinHandle<()> {
        let tracker = self.clone();
        let guard = InFlightGuard::acquire(&self.in_flight);
        tokio::spawn(async move {
            let _guard = guard;
            let provider = entry.provider;
            if let Err(e) = tracker.track_usage(entry).await {
                tracker.failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to persist usage for provider {}: {}", provider, e);
            }
        })
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Submitted records not yet written (or failed).
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until every submitted record has been handled. Returns `false`
    /// if some were still pending when `limit` ran out.
    pub async fn flush(&self, limit: Duration) -> bool {
        let drained = tokio::time::timeout(limit, async {
            loop {
                let notified = self.in_flight.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("{} usage records still pending after {:?}", self.pending(), limit);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::database::Database;
    use crate::storage::usage::{InMemoryUsageSink, UsageRepository};
    use async_trait::async_trait;
    use futures_util::future::join_all;

    fn entry(conversation: &str) -> UsageEntry {
        UsageEntry {
            user_id: "u-1".to_string(),
            conversation_id: Some(conversation.to_string()),
            provider: ProviderId::OpenAI,
            model: "gpt-4o-mini".to_string(),
            usage: TokenUsage::new(60, 40),
            cost: Some(Decimal::new(1, 2)), // 0.01
            memories_used: 0,
            duration_ms: Some(10),
        }
    }

    fn tracker(sink: Arc<dyn PersistenceSink>) -> UsageTracker {
        UsageTracker::new(Arc::new(ProviderRegistry::builder().build()), sink)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_in_memory() {
        let sink = Arc::new(InMemoryUsageSink::new());
        let tracker = tracker(sink.clone());

        let handles: Vec<_> = (0..10).map(|_| tracker.submit(entry("c-1"))).collect();
        join_all(handles).await;

        let totals = sink.conversation_totals("c-1").unwrap();
        assert_eq!(totals.total_tokens, 1000);
        assert_eq!(totals.total_cost, Decimal::new(10, 2));
        assert_eq!(totals.request_count, 10);
        assert_eq!(sink.records().len(), 10);
        assert_eq!(tracker.failure_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_sqlite() {
        let db = Database::in_memory().await.unwrap();
        let repo = Arc::new(UsageRepository::new(db.get_pool()));
        let tracker = tracker(repo.clone());

        let handles: Vec<_> = (0..10).map(|_| tracker.submit(entry("c-1"))).collect();
        join_all(handles).await;

        let totals = repo.conversation_totals("c-1").await.unwrap().unwrap();
        assert_eq!(totals.total_tokens, 1000);
        assert_eq!(totals.total_cost, Decimal::new(10, 2));
        assert_eq!(repo.usage_for_user("u-1", 100).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_cost_derived_from_price_table() {
        let sink = Arc::new(InMemoryUsageSink::new());
        let tracker = tracker(sink.clone());

        let mut unpriced = entry("c-2");
        unpriced.cost = None;
        unpriced.usage = TokenUsage::new(1_000_000, 0);
        let record = tracker.track_usage(unpriced).await.unwrap();
        // gpt-4o-mini input is 0.15 per 1M tokens.
        assert_eq!(record.cost, Decimal::new(15, 2));

        let mut snapshot = entry("c-2");
        snapshot.cost = None;
        snapshot.model = "gpt-4o-mini-2024-07-18".to_string();
        snapshot.usage = TokenUsage::new(1_000_000, 1_000_000);
        let record = tracker.track_usage(snapshot).await.unwrap();
        assert_eq!(record.cost, Decimal::new(75, 2));

        let mut unknown = entry("c-2");
        unknown.cost = None;
        unknown.model = "gpt-unknown".to_string();
        let record = tracker.track_usage(unknown).await.unwrap();
        assert_eq!(record.cost, Decimal::ZERO);
    }

    struct FailingSink;

    #[async_trait]
    impl PersistenceSink for FailingSink {
        async fn record_usage(&self, _record: &UsageRecord) -> Result<()> {
            Err(Error::persistence("disk full"))
        }

        async fn increment_conversation_totals(
            &self,
            _conversation_id: &str,
            _user_id: &str,
            _tokens: u64,
            _cost: Decimal,
        ) -> Result<()> {
            Err(Error::persistence("disk full"))
        }
    }

    #[tokio::test]
    async fn test_submit_failures_are_counted_not_raised() {
        let tracker = tracker(Arc::new(FailingSink));
        tracker.submit(entry("c-3")).await.unwrap();
        tracker.submit(entry("c-3")).await.unwrap();
        assert_eq!(tracker.failure_count(), 2);
    }

    struct SlowSink {
        delay: Duration,
        inner: InMemoryUsageSink,
    }

    #[async_trait]
    impl PersistenceSink for SlowSink {
        async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.record_usage(record).await
        }

        async fn increment_conversation_totals(
            &self,
            conversation_id: &str,
            user_id: &str,
            tokens: u64,
            cost: Decimal,
        ) -> Result<()> {
            self.inner
                .increment_conversation_totals(conversation_id, user_id, tokens, cost)
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_pending_records() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_secs(2),
            inner: InMemoryUsageSink::new(),
        });
        let tracker = tracker(sink.clone());

        drop(tracker.submit(entry("c-4")));
        drop(tracker.submit(entry("c-4")));
        assert_eq!(tracker.pending(), 2);
        assert!(sink.inner.records().is_empty());

        assert!(tracker.flush(Duration::from_secs(10)).await);
        assert_eq!(tracker.pending(), 0);
        assert_eq!(sink.inner.records().len(), 2);

        // Nothing pending returns at once.
        assert!(tracker.flush(Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_gives_up_after_limit() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_secs(30),
            inner: InMemoryUsageSink::new(),
        });
        let tracker = tracker(sink.clone());

        drop(tracker.submit(entry("c-5")));
        assert!(!tracker.flush(Duration::from_secs(1)).await);
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_flushed_records_survive_runtime_shutdown() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let paths = crate::platform::AppPaths::with_root(temp_dir.path());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let db = Database::open(&paths, "usage.db").await.unwrap();
            let tracker = tracker(Arc::new(UsageRepository::new(db.get_pool())));
            drop(tracker.submit(entry("c-6")));
            assert!(tracker.flush(Duration::from_secs(10)).await);
            db.close().await;
        });
        drop(runtime);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let db = Database::open(&paths, "usage.db").await.unwrap();
            let repo = UsageRepository::new(db.get_pool());
            assert_eq!(repo.usage_for_user("u-1", 10).await.unwrap().len(), 1);
            let totals = repo.conversation_totals("c-6").await.unwrap().unwrap();
            assert_eq!(totals.request_count, 1);
        });
    }
}
