use crate::embeddings::cosine_similarity;
use crate::error::ProviderError;
use crate::models::{Category, NewKbEntry, SearchResult};
use crate::traits::KnowledgeBase;
use async_trait::async_trait;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: Category,
    pub image_url: Option<String>,
    pub embedding: Vec<f32>,
    pub status: EntryStatus,
}

/// Knowledge base held in process memory; brute-force cosine search.
pub struct InMemoryKnowledgeBase {
    entries: RwLock<Vec<StoredEntry>>,
    /// Status given to entries written through `create_entry`.
    default_status: EntryStatus,
}

impl Default for InMemoryKnowledgeBase {
    fn default() -> Self {
        Self::new(EntryStatus::Published)
    }
}

impl InMemoryKnowledgeBase {
    pub fn new(default_status: EntryStatus) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            default_status,
        }
    }

    pub fn insert(&self, entry: StoredEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<StoredEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn search_published(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let entries = self.entries.read().map_err(|_| ProviderError::BackendResponse {
            backend: "memory".to_string(),
            details: "knowledge base lock poisoned".to_string(),
        })?;

        let mut hits: Vec<SearchResult> = entries
            .iter()
            .filter(|entry| entry.status == EntryStatus::Published)
            .map(|entry| SearchResult {
                id: entry.id.clone(),
                question: entry.question.clone(),
                answer: entry.answer.clone(),
                category: entry.category,
                image_url: entry.image_url.clone(),
                similarity: cosine_similarity(embedding, &entry.embedding),
            })
            .filter(|hit| hit.similarity >= threshold)
            .collect();

        hits.sort_by(|left, right| right.similarity.total_cmp(&left.similarity));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn create_entry(&self, entry: NewKbEntry) -> Result<String, ProviderError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut entries = self.entries.write().map_err(|_| ProviderError::BackendResponse {
            backend: "memory".to_string(),
            details: "knowledge base lock poisoned".to_string(),
        })?;
        entries.push(StoredEntry {
            id: id.clone(),
            question: entry.question,
            answer: entry.answer,
            category: entry.category,
            image_url: entry.image_url,
            embedding: entry.embedding,
            status: self.default_status,
        });
        Ok(id)
    }
}
