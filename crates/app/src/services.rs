use anyhow::Context;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supportkb_core::{
    AnswerRouter, CharacterNgramEmbedder, ChatCompletionsClient, Embedder, FallbackRenderer,
    ImageStore, InMemoryKnowledgeBase, IngestionOptions, JobLimits, KnowledgeBase,
    LocalDirImageStore, OpenAiEmbedder, PipelineDeps, QdrantKnowledgeBase, RouterConfig,
};
use tracing::{info, warn};

/// Collaborator and tuning flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// API key; without one, embeddings fall back to the offline trigram embedder
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Chat model used for Q&A generation and answers
    #[arg(long, env = "SUPPORTKB_CHAT_MODEL", default_value = "gpt-4o-mini")]
    pub chat_model: String,

    /// Sampling temperature for chat completions
    #[arg(long, env = "SUPPORTKB_TEMPERATURE", default_value = "0.2")]
    pub temperature: f32,

    /// Embedding model
    #[arg(long, env = "SUPPORTKB_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Embedding vector size
    #[arg(long, env = "SUPPORTKB_EMBEDDING_DIMENSIONS", default_value = "1536")]
    pub embedding_dimensions: usize,

    /// Qdrant base URL; the knowledge base is kept in memory when unset
    #[arg(long, env = "SUPPORTKB_QDRANT_URL")]
    pub qdrant_url: Option<String>,

    /// Qdrant collection
    #[arg(long, env = "SUPPORTKB_QDRANT_COLLECTION", default_value = "support_kb")]
    pub qdrant_collection: String,

    /// Status given to approved entries in Qdrant; `draft` keeps them out of answers
    #[arg(long, env = "SUPPORTKB_QDRANT_ENTRY_STATUS", default_value = "published")]
    pub qdrant_entry_status: String,

    /// Directory for durable images; page images stay job-local when unset.
    /// `serve` exposes it under `/static`.
    #[arg(long, env = "SUPPORTKB_IMAGE_DIR")]
    pub image_dir: Option<PathBuf>,

    /// Public URL prefix for `--image-dir`; must reach the server's `/static` route
    #[arg(
        long,
        env = "SUPPORTKB_IMAGE_BASE_URL",
        default_value = "http://127.0.0.1:8080/static"
    )]
    pub image_base_url: String,

    #[arg(long, env = "SUPPORTKB_CHUNK_MAX_CHARS", default_value = "1000")]
    pub chunk_max_chars: usize,

    #[arg(long, env = "SUPPORTKB_CHUNK_OVERLAP_CHARS", default_value = "200")]
    pub chunk_overlap_chars: usize,

    #[arg(long, env = "SUPPORTKB_MAX_PAGES", default_value = "20")]
    pub max_pages: u32,

    #[arg(long, env = "SUPPORTKB_RENDER_DPI", default_value = "100")]
    pub render_dpi: u32,

    /// Send PDFs through the text chunk path instead of rendering pages
    #[arg(long, env = "SUPPORTKB_NO_RENDER", default_value_t = false)]
    pub no_render: bool,

    /// Similarity at which a candidate counts as an existing entry
    #[arg(long, env = "SUPPORTKB_DEDUP_THRESHOLD", default_value = "0.90")]
    pub dedup_threshold: f32,

    /// Similarity at which a question is answered straight from the knowledge base
    #[arg(long, env = "SUPPORTKB_MATCH_THRESHOLD", default_value = "0.85")]
    pub match_threshold: f32,

    /// Answer deadline in milliseconds
    #[arg(long, env = "SUPPORTKB_ANSWER_DEADLINE_MS", default_value = "5000")]
    pub answer_deadline_ms: u64,

    #[arg(long, env = "SUPPORTKB_MAX_CONCURRENT_JOBS", default_value = "3")]
    pub max_concurrent_jobs: usize,

    /// Minutes a job stays addressable
    #[arg(long, env = "SUPPORTKB_JOB_TTL_MINUTES", default_value = "60")]
    pub job_ttl_minutes: u64,
}

impl Settings {
    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_max_chars: self.chunk_max_chars,
            chunk_overlap_chars: self.chunk_overlap_chars,
            max_pages: self.max_pages,
            render_dpi: self.render_dpi,
            render_pages: !self.no_render,
            dedup_threshold: self.dedup_threshold,
            ..IngestionOptions::default()
        }
    }

    pub fn job_limits(&self) -> JobLimits {
        JobLimits {
            max_concurrent_jobs: self.max_concurrent_jobs,
            ttl: Duration::from_secs(self.job_ttl_minutes * 60),
            ..JobLimits::default()
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            match_threshold: self.match_threshold,
            deadline: Duration::from_millis(self.answer_deadline_ms),
            ..RouterConfig::default()
        }
    }

    fn api_key(&self) -> Option<&str> {
        self.openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Everything the subcommands need, wired from `Settings`.
pub struct Services {
    pub deps: PipelineDeps,
    pub options: IngestionOptions,
    pub limits: JobLimits,
    pub router: Arc<AnswerRouter>,
    pub image_dir: Option<PathBuf>,
}

impl Services {
    pub async fn build(settings: &Settings) -> anyhow::Result<Self> {
        let embedder: Arc<dyn Embedder> = match settings.api_key() {
            Some(key) => Arc::new(OpenAiEmbedder::new(
                &settings.openai_base_url,
                key,
                &settings.embedding_model,
                settings.embedding_dimensions,
            )),
            None => {
                warn!("no api key configured; using offline trigram embeddings");
                Arc::new(CharacterNgramEmbedder::default())
            }
        };

        let knowledge: Arc<dyn KnowledgeBase> = match &settings.qdrant_url {
            Some(url) => {
                let collection = &settings.qdrant_collection;
                let store = QdrantKnowledgeBase::new(url, collection, embedder.dimensions())
                    .with_created_status(&settings.qdrant_entry_status);
                store
                    .ensure_collection()
                    .await
                    .with_context(|| format!("qdrant collection {collection} unavailable"))?;
                info!(url = %url, collection = %collection, "using qdrant knowledge base");
                Arc::new(store)
            }
            None => {
                info!("using in-memory knowledge base");
                Arc::new(InMemoryKnowledgeBase::default())
            }
        };

        let chat = Arc::new(
            ChatCompletionsClient::new(
                &settings.openai_base_url,
                settings.api_key().unwrap_or_default(),
                &settings.chat_model,
            )
            .with_temperature(settings.temperature),
        );
        if settings.api_key().is_none() {
            warn!("no api key configured; generation calls will fail and answers fall back");
        }

        let image_store = settings.image_dir.as_ref().map(|dir| {
            info!(
                dir = %dir.display(),
                base_url = %settings.image_base_url,
                "storing images on disk"
            );
            Arc::new(LocalDirImageStore::new(dir, &settings.image_base_url)) as Arc<dyn ImageStore>
        });

        let deps = PipelineDeps {
            embedder: embedder.clone(),
            knowledge: knowledge.clone(),
            generator: chat.clone(),
            renderer: Arc::new(FallbackRenderer::default()),
            image_store,
        };
        let router = Arc::new(AnswerRouter::new(
            embedder,
            knowledge,
            chat,
            settings.router_config(),
        ));

        Ok(Self {
            deps,
            options: settings.ingestion_options(),
            limits: settings.job_limits(),
            router,
            image_dir: settings.image_dir.clone(),
        })
    }
}
