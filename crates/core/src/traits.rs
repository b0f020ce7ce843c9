use crate::error::ProviderError;
use crate::generation::{GeneratedAnswer, GeneratedPair, PageInput};
use crate::models::{NewKbEntry, SearchResult};
use async_trait::async_trait;

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Published entries with similarity >= `threshold`, best first, at most `limit`.
    async fn search_published(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, ProviderError>;

    async fn create_entry(&self, entry: NewKbEntry) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores `bytes` durably and returns a public URL.
    async fn upload(&self, bytes: &[u8], key: &str, mime_type: &str)
        -> Result<String, ProviderError>;
}

#[async_trait]
pub trait QaGenerator: Send + Sync {
    /// One call over every rendered page of a document.
    async fn generate_from_pages(
        &self,
        file_name: &str,
        pages: &[PageInput],
    ) -> Result<Vec<GeneratedPair>, ProviderError>;

    async fn generate_from_chunk(
        &self,
        file_name: &str,
        text: &str,
        page_hint: Option<u32>,
    ) -> Result<Vec<GeneratedPair>, ProviderError>;

    /// Textual description of an uploaded image, used as its extracted text.
    async fn describe_image(
        &self,
        file_name: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate_answer(
        &self,
        question: &str,
        context: &[SearchResult],
    ) -> Result<GeneratedAnswer, ProviderError>;
}
