//! Runtime routing of one customer question: direct KB answer, generated
//! answer with an attributed image, or the fixed fallback.

use crate::embeddings::Embedder;
use crate::error::ProviderError;
use crate::models::{AnswerPipelineResult, AnswerSource, RouterConfig, SearchResult};
use crate::traits::{AnswerGenerator, KnowledgeBase};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AnswerRouter {
    embedder: Arc<dyn Embedder>,
    knowledge: Arc<dyn KnowledgeBase>,
    generator: Arc<dyn AnswerGenerator>,
    config: RouterConfig,
}

impl AnswerRouter {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        knowledge: Arc<dyn KnowledgeBase>,
        generator: Arc<dyn AnswerGenerator>,
        config: RouterConfig,
    ) -> Self {
        Self {
            embedder,
            knowledge,
            generator,
            config,
        }
    }

    /// Never fails: provider errors and the deadline both end in the fallback answer.
    /// Outstanding provider calls are dropped when the deadline passes.
    pub async fn answer(&self, question: &str) -> AnswerPipelineResult {
        match tokio::time::timeout(self.config.deadline, self.route(question)).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                warn!(%error, "answer routing failed, using fallback");
                self.fallback()
            }
            Err(_) => {
                warn!(
                    deadline_ms = self.config.deadline.as_millis() as u64,
                    "answer routing timed out"
                );
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> AnswerPipelineResult {
        AnswerPipelineResult {
            answer: self.config.fallback_answer.clone(),
            source: AnswerSource::Fallback,
            matched_kb_id: None,
            similarity_score: None,
            image_url: None,
            kb_results: Vec::new(),
        }
    }

    async fn route(&self, question: &str) -> Result<AnswerPipelineResult, ProviderError> {
        let embedding = self.embedder.embed(question).await?;

        let mut results = self
            .knowledge
            .search_published(
                &embedding,
                self.config.context_threshold,
                self.config.context_limit,
            )
            .await?;
        if results.is_empty() {
            results = self
                .knowledge
                .search_published(&embedding, 0.0, self.config.fallback_context_limit)
                .await?;
        }

        if let Some(top) = results
            .first()
            .filter(|top| top.similarity >= self.config.match_threshold)
        {
            info!(kb_id = %top.id, similarity = top.similarity, "answered from knowledge base");
            return Ok(AnswerPipelineResult {
                answer: top.answer.clone(),
                source: AnswerSource::KbMatch,
                matched_kb_id: Some(top.id.clone()),
                similarity_score: Some(top.similarity),
                image_url: top.image_url.clone(),
                kb_results: results,
            });
        }

        let generated = self.generator.generate_answer(question, &results).await?;
        let image_url = attribute_image(
            &generated.answer,
            generated.context_ref,
            &results,
            self.config.overlap_floor,
        );
        debug!(
            context = results.len(),
            context_ref = ?generated.context_ref,
            has_image = image_url.is_some(),
            "generated answer"
        );

        Ok(AnswerPipelineResult {
            answer: generated.answer,
            source: AnswerSource::AiGenerated,
            matched_kb_id: None,
            similarity_score: results.first().map(|top| top.similarity),
            image_url,
            kb_results: results,
        })
    }
}

/// Picks the image of the context item the answer was built from.
///
/// An explicit 1-based `context_ref` wins when that item has an image.
/// Otherwise the item whose answer shares the most character trigrams with
/// the generated text is used, provided its score is above `floor`.
pub fn attribute_image(
    answer: &str,
    context_ref: Option<usize>,
    context: &[SearchResult],
    floor: f32,
) -> Option<String> {
    let referenced = context_ref
        .and_then(|position| position.checked_sub(1))
        .and_then(|index| context.get(index))
        .and_then(|item| item.image_url.clone());
    if referenced.is_some() {
        return referenced;
    }

    let generated = trigrams(answer);
    context
        .iter()
        .filter(|item| item.image_url.is_some())
        .map(|item| (trigram_overlap(&generated, &trigrams(&item.answer)), item))
        .filter(|(score, _)| *score > floor)
        .max_by(|left, right| left.0.total_cmp(&right.0))
        .and_then(|(_, item)| item.image_url.clone())
}

fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let chars: Vec<char> = text
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    chars
        .windows(3)
        .map(|window| [window[0], window[1], window[2]])
        .collect()
}

/// Shared trigrams over the smaller set, in `[0, 1]`.
pub fn trigram_overlap(left: &HashSet<[char; 3]>, right: &HashSet<[char; 3]>) -> f32 {
    let smaller = left.len().min(right.len());
    if smaller == 0 {
        return 0.0;
    }
    left.intersection(right).count() as f32 / smaller as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{Category, NewKbEntry};
    use crate::stores::InMemoryKnowledgeBase;
    use crate::testing::{published, FakeAnswerer};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn router(
        knowledge: Arc<dyn KnowledgeBase>,
        generator: Arc<FakeAnswerer>,
        config: RouterConfig,
    ) -> AnswerRouter {
        AnswerRouter::new(
            Arc::new(CharacterNgramEmbedder::default()),
            knowledge,
            generator,
            config,
        )
    }

    fn context(id: &str, answer: &str, image_url: Option<&str>) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            question: format!("question {id}"),
            answer: answer.to_string(),
            category: Category::Product,
            image_url: image_url.map(str::to_string),
            similarity: 0.5,
        }
    }

    #[tokio::test]
    async fn close_match_is_answered_without_generation() {
        let kb = InMemoryKnowledgeBase::default();
        kb.insert(published(
            "kb-1",
            "How long does shipping take?",
            "Orders ship within 3 business days.",
            Some("https://cdn.example.com/shipping.png"),
        ));
        let generator = Arc::new(FakeAnswerer::default());
        let router = router(Arc::new(kb), generator.clone(), RouterConfig::default());

        let result = router.answer("How long does shipping take?").await;

        assert_eq!(result.source, AnswerSource::KbMatch);
        assert_eq!(result.matched_kb_id.as_deref(), Some("kb-1"));
        assert_eq!(result.answer, "Orders ship within 3 business days.");
        assert_eq!(
            result.image_url.as_deref(),
            Some("https://cdn.example.com/shipping.png")
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn weak_matches_go_to_the_generator() {
        let kb = InMemoryKnowledgeBase::default();
        kb.insert(published(
            "kb-2",
            "Do you ship to Canada?",
            "Yes, we ship to Canada.",
            None,
        ));
        let generator = Arc::new(FakeAnswerer {
            answer: Some("We do not sell gift cards yet.".to_string()),
            ..FakeAnswerer::default()
        });
        let router = router(Arc::new(kb), generator.clone(), RouterConfig::default());

        let result = router.answer("Can I buy a gift card for my friend?").await;

        assert_eq!(result.source, AnswerSource::AiGenerated);
        assert_eq!(result.answer, "We do not sell gift cards yet.");
        assert!(result.matched_kb_id.is_none());
        assert_eq!(result.kb_results.len(), 1, "zero-threshold retry supplies context");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingKnowledgeBase;

    #[async_trait]
    impl KnowledgeBase for FailingKnowledgeBase {
        async fn search_published(
            &self,
            _embedding: &[f32],
            _threshold: f32,
            _limit: usize,
        ) -> Result<Vec<SearchResult>, ProviderError> {
            Err(ProviderError::BackendResponse {
                backend: "test".to_string(),
                details: "search unavailable".to_string(),
            })
        }

        async fn create_entry(&self, _entry: NewKbEntry) -> Result<String, ProviderError> {
            Ok("unused".to_string())
        }
    }

    fn assert_fallback(result: &AnswerPipelineResult, config: &RouterConfig) {
        assert_eq!(result.source, AnswerSource::Fallback);
        assert_eq!(result.answer, config.fallback_answer);
        assert!(result.image_url.is_none());
        assert!(result.matched_kb_id.is_none());
    }

    #[tokio::test]
    async fn provider_failures_become_the_fallback_answer() {
        let config = RouterConfig::default();

        let search_down = router(
            Arc::new(FailingKnowledgeBase),
            Arc::new(FakeAnswerer::default()),
            config.clone(),
        );
        assert_fallback(&search_down.answer("Where is my order?").await, &config);

        let generator_down = router(
            Arc::new(InMemoryKnowledgeBase::default()),
            Arc::new(FakeAnswerer {
                fail: true,
                ..FakeAnswerer::default()
            }),
            config.clone(),
        );
        assert_fallback(&generator_down.answer("Where is my order?").await, &config);
    }

    #[tokio::test]
    async fn slow_generation_is_cut_off_at_the_deadline() {
        let config = RouterConfig {
            deadline: Duration::from_millis(50),
            ..RouterConfig::default()
        };
        let generator = Arc::new(FakeAnswerer {
            delay: Some(Duration::from_secs(30)),
            ..FakeAnswerer::default()
        });
        let router = router(
            Arc::new(InMemoryKnowledgeBase::default()),
            generator.clone(),
            config.clone(),
        );

        let result = router.answer("Is this product waterproof?").await;

        assert_fallback(&result, &config);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_context_ref_wins_when_it_has_an_image() {
        let items = vec![
            context("a", "Machine wash cold.", Some("https://cdn/a.png")),
            context("b", "Tumble dry low.", Some("https://cdn/b.png")),
        ];
        assert_eq!(
            attribute_image("Machine wash cold.", Some(2), &items, 0.15).as_deref(),
            Some("https://cdn/b.png")
        );
    }

    #[test]
    fn overlap_is_used_when_the_reference_has_no_image() {
        let items = vec![
            context("a", "Our sizes run small; order one size up.", Some("https://cdn/sizes.png")),
            context("b", "Returns are free within 30 days.", None),
        ];
        let answer = "Sizes run small, so please order one size up.";
        assert_eq!(
            attribute_image(answer, Some(2), &items, 0.15).as_deref(),
            Some("https://cdn/sizes.png")
        );
        assert_eq!(
            attribute_image(answer, Some(9), &items, 0.15).as_deref(),
            Some("https://cdn/sizes.png")
        );
    }

    #[test]
    fn weak_overlap_attributes_nothing() {
        let items = vec![context("a", "Machine wash cold.", Some("https://cdn/a.png"))];
        assert_eq!(
            attribute_image("We accept PayPal and Visa.", None, &items, 0.15),
            None
        );
    }

    #[test]
    fn overlap_ignores_whitespace_and_case() {
        let left = trigrams("Free  Shipping");
        let right = trigrams("freeshipping");
        assert!((trigram_overlap(&left, &right) - 1.0).abs() < f32::EPSILON);
        assert_eq!(trigram_overlap(&trigrams("ab"), &right), 0.0);
    }
}
