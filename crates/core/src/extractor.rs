use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use crate::models::UploadedFile;
use lopdf::Document;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image { mime_type: String },
    Text,
}

const TEXT_EXTENSIONS: [&str; 7] = ["txt", "md", "markdown", "csv", "json", "html", "log"];

pub fn detect_kind(file: &UploadedFile) -> Result<DocumentKind, IngestError> {
    let extension = Path::new(&file.name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();
    let mime = file.mime_type.as_deref().unwrap_or_default().to_lowercase();

    if extension == "pdf" || mime == "application/pdf" {
        return Ok(DocumentKind::Pdf);
    }

    if let Some(mime_type) = image_mime(&extension) {
        return Ok(DocumentKind::Image {
            mime_type: mime_type.to_string(),
        });
    }
    if mime.starts_with("image/") {
        return Ok(DocumentKind::Image {
            mime_type: mime.clone(),
        });
    }

    if TEXT_EXTENSIONS.contains(&extension.as_str()) || mime.starts_with("text/") {
        return Ok(DocumentKind::Text);
    }

    Err(IngestError::UnsupportedDocument(file.name.clone()))
}

fn image_mime(extension: &str) -> Option<&'static str> {
    match extension {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub trait PdfExtractor {
    fn extract_pages(&self, bytes: &[u8], max_pages: u32) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    /// Returns every page up to `max_pages`, including pages with no text layer.
    fn extract_pages(&self, bytes: &[u8], max_pages: u32) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            if page_no > max_pages {
                break;
            }
            let text = document
                .extract_text(&[page_no])
                .map(|raw| normalize_whitespace(&raw))
                .unwrap_or_default();
            pages.push(PageText {
                number: page_no,
                text,
            });
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse("pdf has no pages".to_string()));
        }

        Ok(pages)
    }
}

pub fn extract_page_texts(bytes: &[u8], max_pages: u32) -> Result<Vec<PageText>, IngestError> {
    LopdfExtractor.extract_pages(bytes, max_pages)
}

pub fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    normalize_whitespace(text.trim_start_matches('\u{feff}'))
}

/// Pages joined into one text, remembering where each page starts.
#[derive(Debug, Clone, Default)]
pub struct JoinedPages {
    pub text: String,
    starts: Vec<(usize, u32)>,
}

impl JoinedPages {
    pub fn new(pages: &[PageText]) -> Self {
        let mut joined = JoinedPages::default();
        let mut offset = 0usize;
        for page in pages.iter().filter(|page| !page.text.is_empty()) {
            if !joined.text.is_empty() {
                joined.text.push_str("\n\n");
                offset += 2;
            }
            joined.starts.push((offset, page.number));
            joined.text.push_str(&page.text);
            offset += page.text.chars().count();
        }
        joined
    }

    /// Page containing the character at `offset`.
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        let position = self.starts.partition_point(|(start, _)| *start <= offset);
        position
            .checked_sub(1)
            .and_then(|index| self.starts.get(index))
            .map(|(_, page)| *page)
    }
}
