use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Manifest mismatch: {0}")]
    ManifestMismatch(String),
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),
    #[error("Upstream failure: {0}")]
    Upstream(String),
    #[error("All retrievers failed")]
    AllRetrieversFailed,
    #[error("Reranker unavailable: {0}")]
    RerankerUnavailable(String),
    #[error("Build already in progress for corpus {0}")]
    BuildConflict(String),
    #[error("Build failed: {0}")]
    BuildFailed(String),
    #[error("Capacity exceeded: {0}")]
    Capacity(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Stable machine-readable error kind surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::OpenAI(_) => "openai",
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::ManifestMismatch(_) => "manifest_mismatch",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Upstream(_) => "upstream_failure",
            Self::AllRetrieversFailed => "all_retrievers_failed",
            Self::RerankerUnavailable(_) => "reranker_unavailable",
            Self::BuildConflict(_) => "build_conflict",
            Self::BuildFailed(_) => "build_failed",
            Self::Capacity(_) => "capacity",
            Self::LLMParsing(_) => "llm_parsing",
            Self::Join(_) => "join",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Reqwest(_) => "http",
            Self::Anyhow(_) => "internal",
            Self::InternalError(_) => "internal",
        }
    }

    /// True for errors that demote a retriever to an empty result instead of
    /// failing the whole query.
    pub fn is_demotable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::Upstream(_) | Self::Database(_) | Self::OpenAI(_)
        )
    }
}
