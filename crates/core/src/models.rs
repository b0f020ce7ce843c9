use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Fixed label set a generated Q&A pair may be filed under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Shipping,
    Returns,
    Payment,
    Product,
    Order,
    Account,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Shipping,
        Category::Returns,
        Category::Payment,
        Category::Product,
        Category::Order,
        Category::Account,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Shipping => "shipping",
            Category::Returns => "returns",
            Category::Payment => "payment",
            Category::Product => "product",
            Category::Order => "order",
            Category::Account => "account",
            Category::Other => "other",
        }
    }

    /// Maps a free-form model label onto the fixed set. Unknown labels become `Other`.
    pub fn from_label(label: &str) -> Self {
        let lowered = label.trim().to_lowercase();
        match lowered.as_str() {
            "shipping" | "delivery" => Category::Shipping,
            "returns" | "return" | "refund" | "exchange" => Category::Returns,
            "payment" | "billing" => Category::Payment,
            "product" => Category::Product,
            "order" | "orders" => Category::Order,
            "account" | "membership" => Category::Account,
            _ => Category::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateRef {
    pub existing_id: String,
    pub existing_question: String,
    pub similarity: f32,
}

/// A machine-generated Q&A pair awaiting human review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaCandidate {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: Category,
    pub image_url: Option<String>,
    pub source_file: String,
    /// Chunk index for text documents, 1-based page number for page-batch documents.
    pub source_index: u32,
    pub is_duplicate: bool,
    pub duplicate_of: Option<DuplicateRef>,
}

impl QaCandidate {
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        category: Category,
        source_file: impl Into<String>,
        source_index: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.into(),
            answer: answer.into(),
            category,
            image_url: None,
            source_file: source_file.into(),
            source_index,
            is_duplicate: false,
            duplicate_of: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: Category,
    pub image_url: Option<String>,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// A Q&A pair about to be written to the permanent knowledge base.
#[derive(Debug, Clone)]
pub struct NewKbEntry {
    pub question: String,
    pub answer: String,
    pub category: Category,
    pub image_url: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Bytes,
}

impl UploadedFile {
    pub fn new(
        name: impl Into<String>,
        mime_type: Option<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type,
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    KbMatch,
    AiGenerated,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerPipelineResult {
    pub answer: String,
    pub source: AnswerSource,
    pub matched_kb_id: Option<String>,
    pub similarity_score: Option<f32>,
    pub image_url: Option<String>,
    pub kb_results: Vec<SearchResult>,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub min_chunk_chars: usize,
    pub max_pages: u32,
    pub render_dpi: u32,
    /// When false, PDFs skip rasterization and go through the chunked text path.
    pub render_pages: bool,
    pub dedup_threshold: f32,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 1_000,
            chunk_overlap_chars: 200,
            min_chunk_chars: 50,
            max_pages: 20,
            render_dpi: 100,
            render_pages: true,
            dedup_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobLimits {
    pub max_files: usize,
    pub max_file_bytes: usize,
    pub max_batch_bytes: usize,
    pub max_concurrent_jobs: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Prefix for server-served job images: `{prefix}/{job_id}/images/{key}`.
    pub public_image_base: String,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_file_bytes: 20 * 1024 * 1024,
            max_batch_bytes: 50 * 1024 * 1024,
            max_concurrent_jobs: 3,
            ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            public_image_base: "/api/ingest/jobs".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub match_threshold: f32,
    pub context_threshold: f32,
    pub context_limit: usize,
    pub fallback_context_limit: usize,
    pub overlap_floor: f32,
    pub deadline: Duration,
    pub fallback_answer: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.85,
            context_threshold: 0.30,
            context_limit: 5,
            fallback_context_limit: 3,
            overlap_floor: 0.15,
            deadline: Duration::from_secs(5),
            fallback_answer: "Sorry, I couldn't find an answer to that right now. \
                              A member of our support team will follow up shortly."
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_labels_are_constrained() {
        assert_eq!(Category::from_label(" Shipping "), Category::Shipping);
        assert_eq!(Category::from_label("REFUND"), Category::Returns);
        assert_eq!(Category::from_label("weather"), Category::Other);
        for category in Category::ALL {
            assert_eq!(Category::from_label(category.as_str()), category);
        }
    }

    #[test]
    fn category_serializes_snake_case() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&Category::Returns)?;
        assert_eq!(json, "\"returns\"");
        Ok(())
    }
}
