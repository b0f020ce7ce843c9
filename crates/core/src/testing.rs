//! Fakes shared by the unit tests of the pipeline, job and answer modules.

use crate::embeddings::CharacterNgramEmbedder;
use crate::error::{IngestError, ProviderError};
use crate::events::{IngestEventKind, PipelineMessage};
use crate::generation::{GeneratedAnswer, GeneratedPair, PageInput};
use crate::ingest::{IngestionPipeline, PipelineDeps};
use crate::models::{Category, IngestionOptions, SearchResult};
use crate::render::{PageRenderer, RenderedPage};
use crate::stores::{EntryStatus, InMemoryKnowledgeBase, StoredEntry};
use crate::traits::{AnswerGenerator, ImageStore, QaGenerator};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

/// One pair per chunk (or per page). Chunks containing `FAIL` error out.
#[derive(Default)]
pub struct FakeGenerator {
    pub calls: AtomicUsize,
    /// When set, every generation call waits for a permit first.
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeGenerator {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        }
    }

    async fn wait(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
    }
}

pub fn question_for(text: &str) -> String {
    let head: String = text.chars().take(40).collect();
    format!("What does this say: {}?", head.trim())
}

#[async_trait]
impl QaGenerator for FakeGenerator {
    async fn generate_from_pages(
        &self,
        _file_name: &str,
        pages: &[PageInput],
    ) -> Result<Vec<GeneratedPair>, ProviderError> {
        self.wait().await;
        Ok(pages
            .iter()
            .map(|page| GeneratedPair {
                question: format!("What is covered on page {}?", page.number),
                answer: format!("Page {} explains it.", page.number),
                category: Category::Product,
                page_number: Some(page.number),
            })
            .collect())
    }

    async fn generate_from_chunk(
        &self,
        _file_name: &str,
        text: &str,
        page_hint: Option<u32>,
    ) -> Result<Vec<GeneratedPair>, ProviderError> {
        self.wait().await;
        if text.contains("FAIL") {
            return Err(ProviderError::BackendResponse {
                backend: "fake".to_string(),
                details: "generation failed".to_string(),
            });
        }
        Ok(vec![GeneratedPair {
            question: question_for(text),
            answer: text.chars().take(80).collect(),
            category: Category::Shipping,
            page_number: page_hint,
        }])
    }

    async fn describe_image(
        &self,
        file_name: &str,
        _bytes: &[u8],
        _mime_type: &str,
    ) -> Result<String, ProviderError> {
        Ok(format!(
            "Size chart shown in {file_name}: small fits 90cm chest, medium fits 100cm chest, large fits 110cm chest."
        ))
    }
}

pub struct FakeRenderer {
    pub pages: Option<u32>,
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    fn name(&self) -> &str {
        "fake"
    }

    async fn render(
        &self,
        _pdf: &[u8],
        max_pages: u32,
        _dpi: u32,
    ) -> Result<Vec<RenderedPage>, IngestError> {
        match self.pages {
            Some(count) => Ok((1..=count.min(max_pages))
                .map(|number| RenderedPage {
                    number,
                    png: Bytes::from(format!("png-{number}")),
                })
                .collect()),
            None => Err(IngestError::Render("no renderer installed".to_string())),
        }
    }
}

/// Records uploads; fails the calls whose 0-based position is in `fail_calls`.
#[derive(Default)]
pub struct FakeImageStore {
    pub fail_calls: HashSet<usize>,
    pub calls: AtomicUsize,
    pub uploaded: Mutex<Vec<String>>,
}

impl FakeImageStore {
    pub fn failing(fail_calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_calls: fail_calls.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded
            .lock()
            .map(|uploaded| uploaded.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageStore for FakeImageStore {
    async fn upload(
        &self,
        _bytes: &[u8],
        key: &str,
        _mime_type: &str,
    ) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_calls.contains(&call) {
            return Err(ProviderError::BackendResponse {
                backend: "fake-store".to_string(),
                details: "upload rejected".to_string(),
            });
        }
        if let Ok(mut uploaded) = self.uploaded.lock() {
            uploaded.push(key.to_string());
        }
        Ok(format!("https://cdn.example.com/{key}"))
    }
}

/// Answers from the first context item; counts calls.
#[derive(Default)]
pub struct FakeAnswerer {
    pub calls: AtomicUsize,
    pub context_ref: Option<usize>,
    pub answer: Option<String>,
    pub fail: bool,
    pub delay: Option<std::time::Duration>,
}

#[async_trait]
impl AnswerGenerator for FakeAnswerer {
    async fn generate_answer(
        &self,
        _question: &str,
        context: &[SearchResult],
    ) -> Result<GeneratedAnswer, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ProviderError::BackendResponse {
                backend: "fake".to_string(),
                details: "model unavailable".to_string(),
            });
        }
        let answer = self.answer.clone().unwrap_or_else(|| {
            context
                .first()
                .map(|item| item.answer.clone())
                .unwrap_or_else(|| "I am not sure.".to_string())
        });
        Ok(GeneratedAnswer {
            answer,
            context_ref: self.context_ref,
        })
    }
}

pub fn published(
    id: &str,
    question: &str,
    answer: &str,
    image_url: Option<&str>,
) -> StoredEntry {
    StoredEntry {
        id: id.to_string(),
        question: question.to_string(),
        answer: answer.to_string(),
        category: Category::Other,
        image_url: image_url.map(str::to_string),
        embedding: CharacterNgramEmbedder::default().embed_sync(question),
        status: EntryStatus::Published,
    }
}

pub struct Harness {
    pub knowledge: Arc<InMemoryKnowledgeBase>,
    pub generator: Arc<FakeGenerator>,
    pub store: Option<Arc<FakeImageStore>>,
    pub options: IngestionOptions,
    pub rendered_pages: Option<u32>,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            knowledge: Arc::new(InMemoryKnowledgeBase::default()),
            generator: Arc::new(FakeGenerator::default()),
            store: None,
            options: IngestionOptions::default(),
            rendered_pages: Some(2),
        }
    }
}

impl Harness {
    pub fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            embedder: Arc::new(CharacterNgramEmbedder::default()),
            knowledge: self.knowledge.clone(),
            generator: self.generator.clone(),
            renderer: Arc::new(FakeRenderer {
                pages: self.rendered_pages,
            }),
            image_store: self
                .store
                .clone()
                .map(|store| store as Arc<dyn ImageStore>),
        }
    }

    pub fn pipeline(&self) -> Result<IngestionPipeline, IngestError> {
        IngestionPipeline::new(self.deps(), self.options.clone())
    }
}

pub async fn drain(mut rx: mpsc::Receiver<PipelineMessage>) -> Vec<PipelineMessage> {
    let mut messages = Vec::new();
    while let Some(message) = rx.recv().await {
        messages.push(message);
    }
    messages
}

pub fn kinds(messages: &[PipelineMessage]) -> Vec<&'static str> {
    messages.iter().map(|message| message.event.kind.name()).collect()
}

pub fn complete_totals(messages: &[PipelineMessage]) -> Option<(usize, usize, usize)> {
    messages.iter().find_map(|message| match &message.event.kind {
        IngestEventKind::Complete {
            total_candidates,
            duplicates,
            unique,
        } => Some((*total_candidates, *duplicates, *unique)),
        _ => None,
    })
}

/// A small but well-formed PDF with one text line per page.
pub fn minimal_pdf(pages: &[&str]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)?;
    Ok(buffer)
}
