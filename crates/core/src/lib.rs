pub mod answer;
pub mod chunking;
pub mod dedup;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod extractor;
pub mod generation;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod render;
pub mod stores;
pub mod traits;

#[cfg(test)]
mod testing;

pub use answer::{attribute_image, AnswerRouter};
pub use chunking::{chunk_text, normalize_whitespace, sliding_windows, ChunkingConfig, TextChunk};
pub use dedup::{DedupFailure, Deduplicator};
pub use embeddings::{
    cosine_similarity, CharacterNgramEmbedder, Embedder, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, JobError, ProviderError};
pub use events::{
    ErrorStage, EventSink, IngestEvent, IngestEventKind, LocalImage, PipelineMessage, StageError,
};
pub use extractor::{detect_kind, extract_page_texts, DocumentKind, PageText, PdfExtractor};
pub use generation::{ChatCompletionsClient, GeneratedAnswer, GeneratedPair, PageInput};
pub use ingest::{discover_input_files, load_uploaded_file, IngestionPipeline, PipelineDeps};
pub use jobs::{
    ApprovalFailure, ApprovalItem, ApprovalReport, JobSnapshot, JobStatus, JobStore,
    Subscription,
};
pub use models::{
    AnswerPipelineResult, AnswerSource, Category, DuplicateRef, IngestionOptions, JobLimits,
    NewKbEntry, QaCandidate, RouterConfig, SearchResult, UploadedFile,
};
pub use render::{FallbackRenderer, MutoolRenderer, PageRenderer, PdftoppmRenderer};
pub use stores::{InMemoryKnowledgeBase, LocalDirImageStore, QdrantKnowledgeBase};
pub use traits::{AnswerGenerator, ImageStore, KnowledgeBase, QaGenerator};
