use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::{Memory, MemoryStore};

/// SQLite-backed store of user memories, read by the context augmenter.
pub struct MemoryRepository {
    pool: SqlitePool,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, memory: &Memory) -> Result<()> {
        debug!("Storing memory {} for user {}", memory.id, memory.user_id);
        sqlx::query(
            r#"
            INSERT INTO memories (id, user_id, title, content, content_type, embedding_vector_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&memory.id)
        .bind(&memory.user_id)
        .bind(&memory.title)
        .bind(&memory.content)
        .bind(&memory.content_type)
        .bind(&memory.embedding_vector_id)
        .bind(memory.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Memory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, content, content_type, embedding_vector_id, created_at
            FROM memories WHERE user_id = ? ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_memory).collect()
    }
}

fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<Memory> {
    let created_at: i64 = row.get("created_at");
    Ok(Memory {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        content: row.get("content"),
        content_type: row.get("content_type"),
        embedding_vector_id: row.get("embedding_vector_id"),
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .ok_or_else(|| Error::persistence(format!("Invalid timestamp {}", created_at)))?,
    })
}

#[async_trait]
impl MemoryStore for MemoryRepository {
    async fn get_by_id(&self, id: &str, user_id: &str) -> Result<Option<Memory>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, content, content_type, embedding_vector_id, created_at
            FROM memories WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_memory).transpose()
    }
}
