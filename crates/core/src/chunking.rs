use crate::error::IngestError;
use crate::models::IngestionOptions;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            max_chars: value.chunk_max_chars,
            overlap_chars: value.chunk_overlap_chars,
            min_chars: value.min_chunk_chars,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Window position before noise filtering; never renumbered.
    pub index: u32,
    /// Character offset of the first character in the source text.
    pub start: usize,
    pub text: String,
}

/// Collapses runs of spaces and tabs on each line and drops blank lines.
pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Every `max_chars` window advancing by `max_chars - overlap_chars`, unfiltered.
pub fn sliding_windows(text: &str, config: ChunkingConfig) -> Result<Vec<TextChunk>, IngestError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let step = config.max_chars - config.overlap_chars;
    let mut windows = Vec::new();
    let mut start = 0;
    let mut index = 0u32;

    while start < chars.len() {
        let end = (start + config.max_chars).min(chars.len());
        windows.push(TextChunk {
            index,
            start,
            text: chars[start..end].iter().collect(),
        });
        if end == chars.len() {
            break;
        }
        start += step;
        index += 1;
    }

    Ok(windows)
}

/// Sliding windows with chunks shorter than `min_chars` (after trimming) dropped.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Result<Vec<TextChunk>, IngestError> {
    Ok(sliding_windows(text, config)?
        .into_iter()
        .filter(|chunk| chunk.text.trim().chars().count() >= config.min_chars)
        .collect())
}
