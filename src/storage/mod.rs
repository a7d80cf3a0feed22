// Storage layer for usage accounting and memories

pub mod database;
pub mod memories;
pub mod tracker;
pub mod usage;

pub use database::{decimal_helpers, Database};
pub use memories::MemoryRepository;
pub use tracker::{UsageEntry, UsageTracker};
pub use usage::{ConversationTotals, InMemoryUsageSink, PersistenceSink, UsageRecord, UsageRepository};
