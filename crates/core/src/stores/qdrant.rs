use crate::error::ProviderError;
use crate::models::{Category, NewKbEntry, SearchResult};
use crate::traits::KnowledgeBase;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

const BACKEND: &str = "qdrant";

/// Knowledge base entries stored as Qdrant points with a `status` payload field.
pub struct QdrantKnowledgeBase {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
    created_status: String,
}

impl QdrantKnowledgeBase {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
            created_status: "published".to_string(),
        }
    }

    /// Approved entries land with this status; use `draft` to require a publish step.
    pub fn with_created_status(mut self, status: impl Into<String>) -> Self {
        self.created_status = status.into();
        self
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    pub async fn ensure_collection(&self) -> Result<(), ProviderError> {
        let response = self.client.get(self.collection_url()).send().await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(ProviderError::BackendResponse {
                backend: BACKEND.to_string(),
                details: response.status().to_string(),
            });
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": {"size": self.vector_size, "distance": "Cosine"}
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("collection setup failed with {}", response.status()),
            });
        }

        Ok(())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), ProviderError> {
        if vector.len() != self.vector_size {
            return Err(ProviderError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!(
                    "vector dimension {} != {}",
                    vector.len(),
                    self.vector_size
                ),
            });
        }
        Ok(())
    }
}

fn hit_to_result(hit: &Value) -> Option<SearchResult> {
    let id = match hit.pointer("/id")? {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let text = |field: &str| {
        hit.pointer(&format!("/payload/{field}"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Some(SearchResult {
        id,
        question: text("question").unwrap_or_default(),
        answer: text("answer").unwrap_or_default(),
        category: text("category")
            .as_deref()
            .map(Category::from_label)
            .unwrap_or(Category::Other),
        image_url: text("image_url").filter(|url| !url.is_empty()),
        similarity: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
    })
}

#[async_trait]
impl KnowledgeBase for QdrantKnowledgeBase {
    async fn search_published(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.check_dimensions(embedding)?;

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": embedding,
                "limit": limit,
                "with_payload": true,
                "score_threshold": threshold,
                "filter": {
                    "must": [{"key": "status", "match": {"value": "published"}}]
                },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::BackendResponse {
                backend: BACKEND.to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits.iter().filter_map(hit_to_result).collect())
    }

    async fn create_entry(&self, entry: NewKbEntry) -> Result<String, ProviderError> {
        self.check_dimensions(&entry.embedding)?;

        let id = uuid::Uuid::new_v4().to_string();
        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({
                "points": [{
                    "id": id,
                    "vector": entry.embedding,
                    "payload": {
                        "question": entry.question,
                        "answer": entry.answer,
                        "category": entry.category.as_str(),
                        "image_url": entry.image_url,
                        "status": self.created_status,
                        "created_at": chrono::Utc::now().to_rfc3339(),
                    },
                }]
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::BackendResponse {
                backend: BACKEND.to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_convert_with_payload_fields() {
        let hit = json!({
            "id": "3f1c",
            "score": 0.91,
            "payload": {
                "question": "Where is my order?",
                "answer": "Check the tracking link.",
                "category": "order",
                "image_url": "",
                "status": "published"
            }
        });
        let result = hit_to_result(&hit);
        assert!(result.is_some());
        if let Some(result) = result {
            assert_eq!(result.id, "3f1c");
            assert_eq!(result.category, Category::Order);
            assert_eq!(result.image_url, None);
            assert!((result.similarity - 0.91).abs() < 1e-6);
        }
    }

    #[test]
    fn numeric_ids_are_stringified() {
        let hit = json!({"id": 42, "score": 0.5, "payload": {}});
        assert_eq!(hit_to_result(&hit).map(|result| result.id), Some("42".to_string()));
        assert!(hit_to_result(&json!({"score": 0.5})).is_none());
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_rejected_before_any_request() {
        let kb = QdrantKnowledgeBase::new("http://localhost:1", "kb", 4);
        let result = kb.search_published(&[1.0, 0.0], 0.5, 3).await;
        assert!(matches!(result, Err(ProviderError::BackendResponse { .. })));
    }
}
