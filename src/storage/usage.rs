use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::ProviderId;
use crate::storage::database::decimal_helpers;

/// One persisted usage event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub provider: ProviderId,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    pub memories_used: u32,
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }

    pub fn billing_period(&self) -> String {
        format!("{:04}-{:02}", self.timestamp.year(), self.timestamp.month())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTotals {
    pub conversation_id: String,
    pub user_id: String,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub request_count: u64,
}

/// Where the usage tracker writes. Implementations must make the totals
/// increment atomic with respect to concurrent callers.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_usage(&self, record: &UsageRecord) -> Result<()>;

    async fn increment_conversation_totals(
        &self,
        conversation_id: &str,
        user_id: &str,
        tokens: u64,
        cost: Decimal,
    ) -> Result<()>;
}

/// Repository for usage records and per-conversation totals in SQLite.
pub struct UsageRepository {
    pool: SqlitePool,
}

impl UsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent usage records for a user.
    pub async fn usage_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, timestamp, user_id, conversation_id, provider, model,
                   input_tokens, output_tokens, cost, memories_used, duration_ms
            FROM usage_records
            WHERE user_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn conversation_totals(&self, conversation_id: &str) -> Result<Option<ConversationTotals>> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, user_id, total_tokens, total_cost_nanos, request_count
            FROM conversation_totals
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ConversationTotals {
            conversation_id: row.get("conversation_id"),
            user_id: row.get("user_id"),
            total_tokens: row.get::<i64, _>("total_tokens") as u64,
            total_cost: decimal_helpers::nanos_to_decimal(row.get("total_cost_nanos")),
            request_count: row.get::<i64, _>("request_count") as u64,
        }))
    }

    /// Conversations for a user, most recently active first.
    pub async fn conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationTotals>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, user_id, total_tokens, total_cost_nanos, request_count
            FROM conversation_totals
            WHERE user_id = ?
            ORDER BY updated_at DESC, conversation_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationTotals {
                conversation_id: row.get("conversation_id"),
                user_id: row.get("user_id"),
                total_tokens: row.get::<i64, _>("total_tokens") as u64,
                total_cost: decimal_helpers::nanos_to_decimal(row.get("total_cost_nanos")),
                request_count: row.get::<i64, _>("request_count") as u64,
            })
            .collect())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UsageRecord> {
    let provider: String = row.get("provider");
    let cost: String = row.get("cost");
    let timestamp: i64 = row.get("timestamp");

    Ok(UsageRecord {
        id: row.get("request_id"),
        user_id: row.get("user_id"),
        conversation_id: row.get("conversation_id"),
        provider: provider.parse()?,
        model: row.get("model"),
        input_tokens: row.get::<i64, _>("input_tokens") as u32,
        output_tokens: row.get::<i64, _>("output_tokens") as u32,
        cost: decimal_helpers::string_to_decimal(&cost)?,
        memories_used: row.get::<i64, _>("memories_used") as u32,
        duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
        timestamp: Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| Error::persistence(format!("Invalid timestamp {}", timestamp)))?,
    })
}

#[async_trait]
impl PersistenceSink for UsageRepository {
    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        debug!(
            "Recording usage: provider={}, model={}, input_tokens={}, output_tokens={}, cost={}",
            record.provider, record.model, record.input_tokens, record.output_tokens, record.cost
        );

        sqlx::query(
            r#"
            INSERT INTO usage_records (
                request_id, timestamp, user_id, conversation_id, provider, model,
                input_tokens, output_tokens, cost, memories_used, duration_ms, billing_period
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.timestamp.timestamp())
        .bind(&record.user_id)
        .bind(&record.conversation_id)
        .bind(record.provider.as_str())
        .bind(&record.model)
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(decimal_helpers::decimal_to_string(record.cost))
        .bind(record.memories_used as i64)
        .bind(record.duration_ms.map(|d| d as i64))
        .bind(record.billing_period())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_conversation_totals(
        &self,
        conversation_id: &str,
        user_id: &str,
        tokens: u64,
        cost: Decimal,
    ) -> Result<()> {
        let nanos = decimal_helpers::decimal_to_nanos(cost)?;

        // Single statement: concurrent increments never lose an update.
        sqlx::query(
            r#"
            INSERT INTO conversation_totals (
                conversation_id, user_id, total_tokens, total_cost_nanos, request_count, updated_at
            ) VALUES (?, ?, ?, ?, 1, unixepoch())
            ON CONFLICT(conversation_id) DO UPDATE SET
                total_tokens = total_tokens + excluded.total_tokens,
                total_cost_nanos = total_cost_nanos + excluded.total_cost_nanos,
                request_count = request_count + 1,
                updated_at = unixepoch()
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(tokens as i64)
        .bind(nanos)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Process-local sink, used when usage persistence is disabled and in tests.
#[derive(Default)]
pub struct InMemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
    totals: Mutex<HashMap<String, ConversationTotals>>,
}

impl InMemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }

    pub fn conversation_totals(&self, conversation_id: &str) -> Option<ConversationTotals> {
        self.totals.lock().get(conversation_id).cloned()
    }
}

#[async_trait]
impl PersistenceSink for InMemoryUsageSink {
    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn increment_conversation_totals(
        &self,
        conversation_id: &str,
        user_id: &str,
        tokens: u64,
        cost: Decimal,
    ) -> Result<()> {
        let mut totals = self.totals.lock();
        let entry = totals
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationTotals {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                total_tokens: 0,
                total_cost: Decimal::ZERO,
                request_count: 0,
            });
        entry.total_tokens += tokens;
        entry.total_cost += cost;
        entry.request_count += 1;
        Ok(())
    }
}

pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}
