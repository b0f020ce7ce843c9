use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported document type: {0}")]
    UnsupportedDocument(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("page rendering failed: {0}")]
    Render(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("event channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no files were uploaded")]
    NoFiles,

    #[error("too many files: {count} (limit {limit})")]
    TooManyFiles { count: usize, limit: usize },

    #[error("file {name} is {size} bytes (limit {limit})")]
    FileTooLarge { name: String, size: usize, limit: usize },

    #[error("upload batch is {size} bytes (limit {limit})")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("{active} ingestion jobs already processing (limit {limit})")]
    AtCapacity { active: usize, limit: usize },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("image {key} not found in job {job_id}")]
    ImageNotFound { job_id: String, key: String },

    #[error("job {0} has not finished processing")]
    NotFinished(String),

    #[error("invalid approval request: {0}")]
    InvalidApproval(String),
}

impl JobError {
    /// Validation and capacity errors are rejected before any job exists.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::NoFiles
                | JobError::TooManyFiles { .. }
                | JobError::FileTooLarge { .. }
                | JobError::BatchTooLarge { .. }
                | JobError::InvalidApproval(_)
        )
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
