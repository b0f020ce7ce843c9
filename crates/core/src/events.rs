//! Typed progress events emitted by the ingestion pipeline.

use crate::error::IngestError;
use crate::models::QaCandidate;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    TextExtraction,
    PageRendering,
    ImageUpload,
    QaGeneration,
    Dedup,
    Pipeline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageError {
    pub stage: ErrorStage,
    pub file_name: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
}

impl StageError {
    pub fn new(stage: ErrorStage, file_name: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            stage,
            file_name: file_name.map(str::to_string),
            message: message.into(),
            page: None,
            chunk_index: None,
            candidate_id: None,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_chunk(mut self, chunk_index: u32) -> Self {
        self.chunk_index = Some(chunk_index);
        self
    }

    pub fn with_candidate(mut self, candidate_id: impl Into<String>) -> Self {
        self.candidate_id = Some(candidate_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEventKind {
    FileStart {
        file_name: String,
        file_index: usize,
        total_files: usize,
    },
    TextExtracted {
        file_name: String,
        char_count: usize,
        page_count: Option<u32>,
    },
    ChunksCreated {
        file_name: String,
        chunk_count: usize,
    },
    PagesRendered {
        file_name: String,
        page_count: u32,
        image_keys: Vec<String>,
    },
    QaGenerating {
        file_name: String,
        unit_index: usize,
        unit_total: usize,
    },
    QaGenerated {
        file_name: String,
        unit_index: usize,
        candidates: Vec<QaCandidate>,
    },
    DedupChecking {
        file_name: String,
        candidate_count: usize,
    },
    FileDone {
        file_name: String,
        candidates: Vec<QaCandidate>,
    },
    Complete {
        total_candidates: usize,
        duplicates: usize,
        unique: usize,
    },
    Error(StageError),
}

impl IngestEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            IngestEventKind::FileStart { .. } => "file_start",
            IngestEventKind::TextExtracted { .. } => "text_extracted",
            IngestEventKind::ChunksCreated { .. } => "chunks_created",
            IngestEventKind::PagesRendered { .. } => "pages_rendered",
            IngestEventKind::QaGenerating { .. } => "qa_generating",
            IngestEventKind::QaGenerated { .. } => "qa_generated",
            IngestEventKind::DedupChecking { .. } => "dedup_checking",
            IngestEventKind::FileDone { .. } => "file_done",
            IngestEventKind::Complete { .. } => "complete",
            IngestEventKind::Error(_) => "error",
        }
    }
}

/// One entry in a run's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: IngestEventKind,
}

/// Raw image bytes produced during a run, addressed by an opaque key.
#[derive(Debug, Clone)]
pub struct LocalImage {
    pub key: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Placeholder reference carried by candidates until the owning job rewrites it.
pub const LOCAL_IMAGE_SCHEME: &str = "local://";

pub fn local_image_ref(key: &str) -> String {
    format!("{LOCAL_IMAGE_SCHEME}{key}")
}

pub fn parse_local_image_ref(reference: &str) -> Option<&str> {
    reference
        .strip_prefix(LOCAL_IMAGE_SCHEME)
        .filter(|key| !key.is_empty())
}

/// What travels over the pipeline channel: the event plus any binary payload
/// the consumer must stash before relaying the event.
#[derive(Debug, Clone)]
pub struct PipelineMessage {
    pub event: IngestEvent,
    pub images: Vec<LocalImage>,
}

/// Sequencing writer half of the pipeline channel.
pub struct EventSink {
    tx: mpsc::Sender<PipelineMessage>,
    next_seq: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PipelineMessage>) -> Self {
        Self { tx, next_seq: 0 }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub async fn emit(&mut self, kind: IngestEventKind) -> Result<(), IngestError> {
        self.emit_with_images(kind, Vec::new()).await
    }

    pub async fn emit_with_images(
        &mut self,
        kind: IngestEventKind,
        images: Vec<LocalImage>,
    ) -> Result<(), IngestError> {
        let event = IngestEvent {
            seq: self.next_seq,
            at: Utc::now(),
            kind,
        };
        self.next_seq += 1;
        self.tx
            .send(PipelineMessage { event, images })
            .await
            .map_err(|_| IngestError::ChannelClosed)
    }

    pub async fn error(&mut self, error: StageError) -> Result<(), IngestError> {
        self.emit(IngestEventKind::Error(error)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() -> Result<(), serde_json::Error> {
        let event = IngestEvent {
            seq: 3,
            at: Utc::now(),
            kind: IngestEventKind::ChunksCreated {
                file_name: "faq.txt".to_string(),
                chunk_count: 4,
            },
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(value["type"], "chunks_created");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["chunk_count"], 4);
        Ok(())
    }

    #[test]
    fn error_events_carry_stage_context() -> Result<(), serde_json::Error> {
        let kind = IngestEventKind::Error(
            StageError::new(ErrorStage::QaGeneration, Some("guide.pdf"), "timeout").with_chunk(2),
        );
        let value = serde_json::to_value(&kind)?;
        assert_eq!(value["type"], "error");
        assert_eq!(value["stage"], "qa_generation");
        assert_eq!(value["file_name"], "guide.pdf");
        assert_eq!(value["chunk_index"], 2);
        assert!(value.get("page").is_none());
        Ok(())
    }

    #[test]
    fn local_refs_round_trip_their_key() {
        let reference = local_image_ref("abc");
        assert_eq!(parse_local_image_ref(&reference), Some("abc"));
        assert_eq!(parse_local_image_ref("local://"), None);
        assert_eq!(parse_local_image_ref("https://cdn.example.com/a.png"), None);
    }

    #[tokio::test]
    async fn sink_assigns_increasing_sequence_numbers() -> Result<(), IngestError> {
        let (mut sink, mut rx) = EventSink::channel(8);
        sink.emit(IngestEventKind::Complete {
            total_candidates: 0,
            duplicates: 0,
            unique: 0,
        })
        .await?;
        sink.error(StageError::new(ErrorStage::Pipeline, None, "boom"))
            .await?;
        drop(sink);

        let mut seqs = Vec::new();
        while let Some(message) = rx.recv().await {
            seqs.push(message.event.seq);
        }
        assert_eq!(seqs, vec![0, 1]);
        Ok(())
    }
}
