use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::memory::types::{Memory, QueryOptions, VectorMatch};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(&self, embedding: &[f32], options: &QueryOptions) -> Result<Vec<VectorMatch>>;

    async fn upsert(&self, id: &str, embedding: &[f32], metadata: serde_json::Value) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Looks a memory up by id, scoped to its owner. Missing rows are `None`.
    async fn get_by_id(&self, id: &str, user_id: &str) -> Result<Option<Memory>>;
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::augmentation_unavailable(format!("failed to create HTTP client: {}", e)))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/v1/embeddings` client.
pub struct OpenAiEmbeddingClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(api_key: String, model: impl Into<String>, endpoint: Option<String>) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            api_key,
            model: model.into(),
            endpoint: endpoint.unwrap_or_else(|| OPENAI_EMBEDDINGS_URL.to_string()),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Embedding API error {}: {}", status, body);
            return Err(Error::augmentation_unavailable(format!("embedding API error {}", status)));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::augmentation_unavailable("embedding response had no data"))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PineconeQuery<'a> {
    vector: &'a [f32],
    top_k: usize,
    filter: &'a serde_json::Value,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct PineconeQueryResponse {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}

/// Pinecone data-plane client for a single index host.
pub struct PineconeVectorStore {
    client: Client,
    host: String,
    api_key: String,
    namespace: Option<String>,
}

impl PineconeVectorStore {
    pub fn new(host: impl Into<String>, api_key: String, namespace: Option<String>) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(30))?,
            host: host.into().trim_end_matches('/').to_string(),
            api_key,
            namespace,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| Error::augmentation_unavailable("invalid vector store API key format"))?;
        headers.insert("Api-Key", key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.host, path);
        debug!("Vector store request: {}", url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Vector store error {} on {}: {}", status, path, body);
            return Err(Error::augmentation_unavailable(format!("vector store error {}", status)));
        }
        Ok(response)
    }
}

#[async_trait]
impl VectorStore for PineconeVectorStore {
    async fn query(&self, embedding: &[f32], options: &QueryOptions) -> Result<Vec<VectorMatch>> {
        let body = serde_json::to_value(PineconeQuery {
            vector: embedding,
            top_k: options.top_k,
            filter: &options.filter,
            include_metadata: true,
            namespace: self.namespace.as_deref(),
        })?;

        let parsed: PineconeQueryResponse = self.post("/query", body).await?.json().await?;
        // The index has no score floor of its own.
        Ok(parsed
            .matches
            .into_iter()
            .filter(|m| m.score >= options.min_score)
            .collect())
    }

    async fn upsert(&self, id: &str, embedding: &[f32], metadata: serde_json::Value) -> Result<()> {
        let mut body = serde_json::json!({
            "vectors": [{ "id": id, "values": embedding, "metadata": metadata }],
        });
        if let Some(namespace) = &self.namespace {
            body["namespace"] = serde_json::Value::String(namespace.clone());
        }
        self.post("/vectors/upsert", body).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut body = serde_json::json!({ "ids": [id] });
        if let Some(namespace) = &self.namespace {
            body["namespace"] = serde_json::Value::String(namespace.clone());
        }
        self.post("/vectors/delete", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinecone_query_shape() {
        let options = QueryOptions::for_user("u-1", 5, 0.7);
        let body = serde_json::to_value(PineconeQuery {
            vector: &[0.1, 0.2],
            top_k: options.top_k,
            filter: &options.filter,
            include_metadata: true,
            namespace: None,
        })
        .unwrap();

        assert_eq!(body["topK"], 5);
        assert_eq!(body["filter"]["userId"], "u-1");
        assert_eq!(body["includeMetadata"], true);
        assert!(body.get("namespace").is_none());
    }

    #[test]
    fn test_query_response_tolerates_missing_metadata() {
        let parsed: PineconeQueryResponse =
            serde_json::from_str(r#"{"matches":[{"id":"m-1","score":0.91}]}"#).unwrap();
        assert_eq!(parsed.matches.len(), 1);
        assert!(parsed.matches[0].metadata.is_null());

        let empty: PineconeQueryResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.matches.is_empty());
    }
}
