use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-owned note that can be injected into a conversation as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub content_type: String,
    pub embedding_vector_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            content: content.into(),
            content_type: "text".to_string(),
            embedding_vector_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A similarity hit returned by the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub top_k: usize,
    pub min_score: f32,
    /// Metadata equality filter, e.g. `{"userId": "u-1"}`.
    pub filter: serde_json::Value,
}

impl QueryOptions {
    pub fn for_user(user_id: &str, top_k: usize, min_score: f32) -> Self {
        Self {
            top_k,
            min_score,
            filter: serde_json::json!({ "userId": user_id }),
        }
    }
}
