use crate::chunking::{chunk_text, ChunkingConfig};
use crate::dedup::Deduplicator;
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::events::{
    local_image_ref, ErrorStage, EventSink, IngestEventKind, LocalImage, PipelineMessage,
    StageError,
};
use crate::extractor::{decode_text, detect_kind, extract_page_texts, DocumentKind, JoinedPages};
use crate::generation::{GeneratedPair, PageInput};
use crate::models::{IngestionOptions, QaCandidate, UploadedFile};
use crate::render::PageRenderer;
use crate::stores::content_key;
use crate::traits::{ImageStore, KnowledgeBase, QaGenerator};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Pending messages between the pipeline task and whoever relays them.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

const PAGE_MIME: &str = "image/png";
const UPLOAD_PREFIX: &str = "ingest";

/// External collaborators one pipeline run talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub embedder: Arc<dyn Embedder>,
    pub knowledge: Arc<dyn KnowledgeBase>,
    pub generator: Arc<dyn QaGenerator>,
    pub renderer: Arc<dyn PageRenderer>,
    /// Durable storage for page and asset images. Without one, images stay
    /// attached to the event stream under `local://` references.
    pub image_store: Option<Arc<dyn ImageStore>>,
}

/// Drives uploaded files through extract, chunk or render, generate and dedup,
/// strictly one file after another.
pub struct IngestionPipeline {
    deps: PipelineDeps,
    options: IngestionOptions,
    chunking: ChunkingConfig,
    dedup: Deduplicator,
}

/// Outcome of persisting one image: a durable URL, or a placeholder plus the
/// bytes that must travel with the next event.
enum ImageRef {
    Durable(String),
    Local(LocalImage),
}

impl ImageRef {
    fn url(&self) -> String {
        match self {
            ImageRef::Durable(url) => url.clone(),
            ImageRef::Local(image) => local_image_ref(&image.key),
        }
    }
}

impl IngestionPipeline {
    pub fn new(deps: PipelineDeps, options: IngestionOptions) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::from(&options);
        chunking.validate()?;
        if options.max_pages == 0 {
            return Err(IngestError::InvalidArgument(
                "max_pages must be greater than zero".to_string(),
            ));
        }

        let dedup = Deduplicator::new(
            deps.embedder.clone(),
            deps.knowledge.clone(),
            options.dedup_threshold,
        );

        Ok(Self {
            deps,
            options,
            chunking,
            dedup,
        })
    }

    /// Runs the pipeline on its own task. Events arrive on the returned
    /// receiver; the handle resolves to the accumulated candidates.
    pub fn spawn(
        self: Arc<Self>,
        files: Vec<UploadedFile>,
    ) -> (
        mpsc::Receiver<PipelineMessage>,
        JoinHandle<Result<Vec<QaCandidate>, IngestError>>,
    ) {
        let (mut sink, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move { self.run(&files, &mut sink).await });
        (rx, handle)
    }

    /// Processes every file in order and finishes with a `complete` event.
    ///
    /// Per-unit failures become error events. The only errors returned are
    /// the ones that stop the whole run, such as the receiver going away.
    pub async fn run(
        &self,
        files: &[UploadedFile],
        sink: &mut EventSink,
    ) -> Result<Vec<QaCandidate>, IngestError> {
        let total_files = files.len();
        let mut all_candidates = Vec::new();

        for (file_index, file) in files.iter().enumerate() {
            info!(file = %file.name, file_index, total_files, "ingesting file");
            sink.emit(IngestEventKind::FileStart {
                file_name: file.name.clone(),
                file_index,
                total_files,
            })
            .await?;

            if let Some(candidates) = self.process_file(file, sink).await? {
                all_candidates.extend(candidates);
            }
        }

        let duplicates = all_candidates
            .iter()
            .filter(|candidate| candidate.is_duplicate)
            .count();
        let total_candidates = all_candidates.len();
        info!(total_candidates, duplicates, "ingestion complete");

        sink.emit(IngestEventKind::Complete {
            total_candidates,
            duplicates,
            unique: total_candidates - duplicates,
        })
        .await?;

        Ok(all_candidates)
    }

    /// `None` when the file was skipped before reaching `file_done`.
    async fn process_file(
        &self,
        file: &UploadedFile,
        sink: &mut EventSink,
    ) -> Result<Option<Vec<QaCandidate>>, IngestError> {
        let kind = match detect_kind(file) {
            Ok(kind) => kind,
            Err(error) => {
                warn!(file = %file.name, stage = "text_extraction", %error, "skipping file");
                sink.error(StageError::new(
                    ErrorStage::TextExtraction,
                    Some(&file.name),
                    error.to_string(),
                ))
                .await?;
                return Ok(None);
            }
        };

        match kind {
            DocumentKind::Pdf if self.options.render_pages => self.process_paged(file, sink).await,
            kind => self.process_chunked(file, kind, sink).await,
        }
    }

    async fn process_paged(
        &self,
        file: &UploadedFile,
        sink: &mut EventSink,
    ) -> Result<Option<Vec<QaCandidate>>, IngestError> {
        let file_name = file.name.as_str();

        let pages = match self.extract_pdf_pages(file).await {
            Ok(pages) => pages,
            Err(error) => {
                warn!(file = %file_name, stage = "text_extraction", %error, "skipping file");
                sink.error(StageError::new(
                    ErrorStage::TextExtraction,
                    Some(file_name),
                    error.to_string(),
                ))
                .await?;
                return Ok(None);
            }
        };
        sink.emit(IngestEventKind::TextExtracted {
            file_name: file_name.to_string(),
            char_count: pages.iter().map(|page| page.text.chars().count()).sum(),
            page_count: Some(pages.len() as u32),
        })
        .await?;

        let rendered = match self
            .deps
            .renderer
            .render(&file.bytes, self.options.max_pages, self.options.render_dpi)
            .await
        {
            Ok(rendered) if !rendered.is_empty() => rendered,
            Ok(_) => {
                return self
                    .abort_rendering(file_name, "renderer produced no pages", sink)
                    .await;
            }
            Err(error) => {
                return self
                    .abort_rendering(file_name, &error.to_string(), sink)
                    .await;
            }
        };

        let local_images: Vec<LocalImage> = rendered
            .iter()
            .map(|page| LocalImage {
                key: uuid::Uuid::new_v4().simple().to_string(),
                mime_type: PAGE_MIME.to_string(),
                bytes: page.png.clone(),
            })
            .collect();
        sink.emit_with_images(
            IngestEventKind::PagesRendered {
                file_name: file_name.to_string(),
                page_count: rendered.len() as u32,
                image_keys: local_images.iter().map(|image| image.key.clone()).collect(),
            },
            local_images.clone(),
        )
        .await?;

        let mut page_urls: HashMap<u32, String> = HashMap::new();
        for (page, image) in rendered.iter().zip(&local_images) {
            let url = match self.upload_page(file_name, page.number, image, sink).await? {
                Some(url) => url,
                None => local_image_ref(&image.key),
            };
            page_urls.insert(page.number, url);
        }

        let texts: HashMap<u32, &str> = pages
            .iter()
            .map(|page| (page.number, page.text.as_str()))
            .collect();
        let inputs: Vec<PageInput> = rendered
            .iter()
            .map(|page| PageInput {
                number: page.number,
                text: texts.get(&page.number).copied().unwrap_or_default().to_string(),
                png: page.png.clone(),
            })
            .collect();

        sink.emit(IngestEventKind::QaGenerating {
            file_name: file_name.to_string(),
            unit_index: 0,
            unit_total: 1,
        })
        .await?;

        let pairs = match self
            .deps
            .generator
            .generate_from_pages(file_name, &inputs)
            .await
        {
            Ok(pairs) => pairs,
            Err(error) => {
                warn!(file = %file_name, stage = "qa_generation", %error, "page batch failed");
                sink.error(StageError::new(
                    ErrorStage::QaGeneration,
                    Some(file_name),
                    error.to_string(),
                ))
                .await?;
                Vec::new()
            }
        };

        let mut candidates: Vec<QaCandidate> = pairs
            .into_iter()
            .map(|pair| {
                let page = pair.page_number;
                let image_url = page.and_then(|number| page_urls.get(&number).cloned());
                build_candidate(pair, file_name, page.unwrap_or_default(), image_url)
            })
            .collect();

        sink.emit(IngestEventKind::QaGenerated {
            file_name: file_name.to_string(),
            unit_index: 0,
            candidates: candidates.clone(),
        })
        .await?;
        sink.emit(IngestEventKind::DedupChecking {
            file_name: file_name.to_string(),
            candidate_count: candidates.len(),
        })
        .await?;
        self.dedup_candidates(file_name, &mut candidates, sink).await?;

        sink.emit(IngestEventKind::FileDone {
            file_name: file_name.to_string(),
            candidates: candidates.clone(),
        })
        .await?;
        Ok(Some(candidates))
    }

    async fn abort_rendering(
        &self,
        file_name: &str,
        message: &str,
        sink: &mut EventSink,
    ) -> Result<Option<Vec<QaCandidate>>, IngestError> {
        warn!(file = %file_name, stage = "page_rendering", reason = message, "aborting file");
        sink.error(StageError::new(
            ErrorStage::PageRendering,
            Some(file_name),
            message,
        ))
        .await?;
        Ok(None)
    }

    async fn process_chunked(
        &self,
        file: &UploadedFile,
        kind: DocumentKind,
        sink: &mut EventSink,
    ) -> Result<Option<Vec<QaCandidate>>, IngestError> {
        let file_name = file.name.as_str();

        let extracted = match self.extract_flat_text(file, &kind).await {
            Ok(extracted) if !extracted.text.trim().is_empty() => extracted,
            Ok(_) => {
                return self
                    .skip_extraction(file_name, "no readable text", sink)
                    .await;
            }
            Err(error) => {
                return self
                    .skip_extraction(file_name, &error.to_string(), sink)
                    .await;
            }
        };
        sink.emit(IngestEventKind::TextExtracted {
            file_name: file_name.to_string(),
            char_count: extracted.text.chars().count(),
            page_count: extracted.page_count,
        })
        .await?;

        let asset = match &kind {
            DocumentKind::Image { mime_type } => {
                Some(self.persist_asset(file, mime_type, sink).await?)
            }
            _ => None,
        };
        let image_url = asset.as_ref().map(ImageRef::url);
        let attachments = match asset {
            Some(ImageRef::Local(image)) => vec![image],
            _ => Vec::new(),
        };

        let chunks = chunk_text(&extracted.text, self.chunking)?;
        sink.emit_with_images(
            IngestEventKind::ChunksCreated {
                file_name: file_name.to_string(),
                chunk_count: chunks.len(),
            },
            attachments,
        )
        .await?;

        let unit_total = chunks.len();
        let mut file_candidates = Vec::new();

        for chunk in &chunks {
            let unit_index = chunk.index as usize;
            let page_hint = extracted
                .pages
                .as_ref()
                .and_then(|pages| pages.page_at(chunk.start));

            sink.emit(IngestEventKind::QaGenerating {
                file_name: file_name.to_string(),
                unit_index,
                unit_total,
            })
            .await?;

            let pairs = match self
                .deps
                .generator
                .generate_from_chunk(file_name, &chunk.text, page_hint)
                .await
            {
                Ok(pairs) => pairs,
                Err(error) => {
                    warn!(
                        file = %file_name,
                        stage = "qa_generation",
                        chunk = chunk.index,
                        %error,
                        "skipping chunk"
                    );
                    let failure = StageError::new(
                        ErrorStage::QaGeneration,
                        Some(file_name),
                        error.to_string(),
                    )
                    .with_chunk(chunk.index);
                    sink.error(failure).await?;
                    continue;
                }
            };
            debug!(file = %file_name, chunk = chunk.index, pairs = pairs.len(), "chunk generated");

            let mut candidates: Vec<QaCandidate> = pairs
                .into_iter()
                .map(|pair| build_candidate(pair, file_name, chunk.index, image_url.clone()))
                .collect();
            self.dedup_candidates(file_name, &mut candidates, sink).await?;

            sink.emit(IngestEventKind::QaGenerated {
                file_name: file_name.to_string(),
                unit_index,
                candidates: candidates.clone(),
            })
            .await?;
            file_candidates.extend(candidates);
        }

        sink.emit(IngestEventKind::FileDone {
            file_name: file_name.to_string(),
            candidates: file_candidates.clone(),
        })
        .await?;
        Ok(Some(file_candidates))
    }

    async fn skip_extraction(
        &self,
        file_name: &str,
        message: &str,
        sink: &mut EventSink,
    ) -> Result<Option<Vec<QaCandidate>>, IngestError> {
        warn!(file = %file_name, stage = "text_extraction", reason = message, "skipping file");
        sink.error(StageError::new(
            ErrorStage::TextExtraction,
            Some(file_name),
            message,
        ))
        .await?;
        Ok(None)
    }

    async fn extract_pdf_pages(
        &self,
        file: &UploadedFile,
    ) -> Result<Vec<crate::extractor::PageText>, IngestError> {
        let bytes = file.bytes.clone();
        let max_pages = self.options.max_pages;
        tokio::task::spawn_blocking(move || extract_page_texts(&bytes, max_pages))
            .await
            .map_err(|error| IngestError::PdfParse(format!("extraction task failed: {error}")))?
    }

    async fn extract_flat_text(
        &self,
        file: &UploadedFile,
        kind: &DocumentKind,
    ) -> Result<ExtractedText, IngestError> {
        match kind {
            DocumentKind::Text => Ok(ExtractedText {
                text: decode_text(&file.bytes),
                page_count: None,
                pages: None,
            }),
            DocumentKind::Pdf => {
                let pages = self.extract_pdf_pages(file).await?;
                let joined = JoinedPages::new(&pages);
                Ok(ExtractedText {
                    text: joined.text.clone(),
                    page_count: Some(pages.len() as u32),
                    pages: Some(joined),
                })
            }
            DocumentKind::Image { mime_type } => {
                let description = self
                    .deps
                    .generator
                    .describe_image(&file.name, &file.bytes, mime_type)
                    .await?;
                Ok(ExtractedText {
                    text: description,
                    page_count: None,
                    pages: None,
                })
            }
        }
    }

    /// Uploads one rendered page. Failures are reported and yield `None`.
    async fn upload_page(
        &self,
        file_name: &str,
        page: u32,
        image: &LocalImage,
        sink: &mut EventSink,
    ) -> Result<Option<String>, IngestError> {
        let Some(store) = &self.deps.image_store else {
            return Ok(None);
        };

        let key = content_key(UPLOAD_PREFIX, &image.bytes, &image.mime_type);
        match store.upload(&image.bytes, &key, &image.mime_type).await {
            Ok(url) => Ok(Some(url)),
            Err(error) => {
                warn!(
                    file = %file_name,
                    stage = "image_upload",
                    page,
                    %error,
                    "page upload failed"
                );
                sink.error(
                    StageError::new(ErrorStage::ImageUpload, Some(file_name), error.to_string())
                        .with_page(page),
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn persist_asset(
        &self,
        file: &UploadedFile,
        mime_type: &str,
        sink: &mut EventSink,
    ) -> Result<ImageRef, IngestError> {
        let local = LocalImage {
            key: uuid::Uuid::new_v4().simple().to_string(),
            mime_type: mime_type.to_string(),
            bytes: file.bytes.clone(),
        };
        let Some(store) = &self.deps.image_store else {
            return Ok(ImageRef::Local(local));
        };

        let key = content_key(UPLOAD_PREFIX, &file.bytes, mime_type);
        match store.upload(&file.bytes, &key, mime_type).await {
            Ok(url) => Ok(ImageRef::Durable(url)),
            Err(error) => {
                warn!(file = %file.name, stage = "image_upload", %error, "asset upload failed");
                sink.error(StageError::new(
                    ErrorStage::ImageUpload,
                    Some(&file.name),
                    error.to_string(),
                ))
                .await?;
                Ok(ImageRef::Local(local))
            }
        }
    }

    async fn dedup_candidates(
        &self,
        file_name: &str,
        candidates: &mut [QaCandidate],
        sink: &mut EventSink,
    ) -> Result<(), IngestError> {
        for failure in self.dedup.check(candidates).await {
            warn!(
                file = %file_name,
                stage = "dedup",
                candidate = %failure.candidate_id,
                reason = %failure.message,
                "dedup check failed"
            );
            sink.error(
                StageError::new(ErrorStage::Dedup, Some(file_name), failure.message)
                    .with_candidate(failure.candidate_id),
            )
            .await?;
        }
        Ok(())
    }
}

struct ExtractedText {
    text: String,
    page_count: Option<u32>,
    pages: Option<JoinedPages>,
}

fn build_candidate(
    pair: GeneratedPair,
    file_name: &str,
    source_index: u32,
    image_url: Option<String>,
) -> QaCandidate {
    let mut candidate = QaCandidate::new(
        pair.question,
        pair.answer,
        pair.category,
        file_name,
        source_index,
    );
    candidate.image_url = image_url;
    candidate
}

/// Every file under `path` the pipeline knows how to read, sorted.
pub fn discover_input_files(path: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(path).into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        let named = UploadedFile::new(name.to_string(), None, Bytes::new());
        if detect_kind(&named).is_ok() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn load_uploaded_file(path: &Path) -> Result<UploadedFile, IngestError> {
    let bytes = fs::read(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::InvalidArgument(format!("path missing filename: {}", path.display()))
        })?;
    Ok(UploadedFile::new(name, None, bytes))
}
