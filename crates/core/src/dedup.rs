use crate::embeddings::Embedder;
use crate::error::ProviderError;
use crate::models::{DuplicateRef, QaCandidate};
use crate::traits::KnowledgeBase;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DedupFailure {
    pub candidate_id: String,
    pub message: String,
}

/// Flags candidates whose question already exists in the published knowledge base.
#[derive(Clone)]
pub struct Deduplicator {
    embedder: Arc<dyn Embedder>,
    knowledge: Arc<dyn KnowledgeBase>,
    threshold: f32,
}

impl Deduplicator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        knowledge: Arc<dyn KnowledgeBase>,
        threshold: f32,
    ) -> Self {
        Self {
            embedder,
            knowledge,
            threshold,
        }
    }

    /// Closest published entry at or above the threshold, if any.
    pub async fn find_duplicate(
        &self,
        question: &str,
    ) -> Result<Option<DuplicateRef>, ProviderError> {
        let embedding = self.embedder.embed(question).await?;
        let hits = self
            .knowledge
            .search_published(&embedding, self.threshold, 1)
            .await?;

        Ok(hits
            .into_iter()
            .next()
            .filter(|hit| hit.similarity >= self.threshold)
            .map(|hit| DuplicateRef {
                existing_id: hit.id,
                existing_question: hit.question,
                similarity: hit.similarity,
            }))
    }

    /// Checks each candidate independently. A failed check leaves that
    /// candidate unflagged and is reported back instead of aborting the batch.
    pub async fn check(&self, candidates: &mut [QaCandidate]) -> Vec<DedupFailure> {
        let mut failures = Vec::new();

        for candidate in candidates.iter_mut() {
            match self.find_duplicate(&candidate.question).await {
                Ok(Some(duplicate)) => {
                    debug!(
                        candidate = %candidate.id,
                        existing = %duplicate.existing_id,
                        similarity = duplicate.similarity,
                        "candidate duplicates an existing entry"
                    );
                    candidate.is_duplicate = true;
                    candidate.duplicate_of = Some(duplicate);
                }
                Ok(None) => {
                    candidate.is_duplicate = false;
                    candidate.duplicate_of = None;
                }
                Err(error) => failures.push(DedupFailure {
                    candidate_id: candidate.id.clone(),
                    message: error.to_string(),
                }),
            }
        }

        failures
    }
}
