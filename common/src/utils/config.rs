use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// Which backend produces dense vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAi,
    FastEmbed,
    /// Deterministic hashing backend, used by tests and offline smoke runs.
    Hashed,
}

/// Tokenizer used by the BM25 index. The resolved choice is pinned in the
/// corpus manifest so queries always tokenize the way the index was built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SparseTokenizer {
    Stemmed,
    Whitespace,
}

impl fmt::Display for SparseTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stemmed => f.write_str("stemmed"),
            Self::Whitespace => f.write_str("whitespace"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    Rrf,
    Weighted,
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rrf => f.write_str("rrf"),
            Self::Weighted => f.write_str("weighted"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerMode {
    None,
    Local,
    Learned,
    Cloud,
}

impl fmt::Display for RerankerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Local => f.write_str("local"),
            Self::Learned => f.write_str("learned"),
            Self::Cloud => f.write_str("cloud"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Ast,
    Greedy,
    Hybrid,
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ast => f.write_str("ast"),
            Self::Greedy => f.write_str("greedy"),
            Self::Hybrid => f.write_str("hybrid"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            address: "ws://localhost:8000".to_owned(),
            username: "root".to_owned(),
            password: "root".to_owned(),
            namespace: "tribrid".to_owned(),
            database: "tribrid".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingBackend,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub retry_max: usize,
    pub cache_enabled: bool,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::OpenAi,
            model: "text-embedding-3-small".to_owned(),
            dimension: 1536,
            batch_size: 32,
            retry_max: 3,
            cache_enabled: true,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSearchConfig {
    pub enabled: bool,
    pub topk_dense: usize,
    pub similarity_threshold: f32,
}

impl Default for VectorSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topk_dense: 20,
            similarity_threshold: 0.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SparseSearchConfig {
    pub enabled: bool,
    pub topk_sparse: usize,
    pub k1: f32,
    pub b: f32,
    pub tokenizer: SparseTokenizer,
}

impl Default for SparseSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topk_sparse: 20,
            k1: 1.2,
            b: 0.75,
            tokenizer: SparseTokenizer::Stemmed,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSearchConfig {
    pub enabled: bool,
    pub max_hops: usize,
    pub topk_graph: usize,
    pub include_communities: bool,
    /// Extract concept entities from comments/docstrings via the chat model.
    pub semantic_entities: bool,
    /// Entity pairs must co-occur in at least this many chunks before a
    /// related_to edge is written.
    pub cooccurrence_threshold: usize,
}

impl Default for GraphSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: 2,
            topk_graph: 10,
            include_communities: false,
            semantic_entities: false,
            cooccurrence_threshold: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub method: FusionMethod,
    pub vector_weight: f32,
    pub sparse_weight: f32,
    pub graph_weight: f32,
    pub rrf_k: f32,
    pub final_k: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::Rrf,
            vector_weight: 1.0,
            sparse_weight: 1.0,
            graph_weight: 1.0,
            rrf_k: 60.0,
            final_k: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub mode: RerankerMode,
    pub local_model: Option<String>,
    /// Directory holding the learned adapter (weights.json + adapter.json).
    pub adapter_path: Option<String>,
    pub cloud_endpoint: Option<String>,
    pub cloud_model: Option<String>,
    pub cloud_api_key: Option<String>,
    pub top_n: usize,
    pub batch_size: usize,
    pub max_length: usize,
    pub pool_size: Option<usize>,
    pub reload_period_sec: u64,
    pub min_reload_interval_sec: u64,
    pub unload_after_sec: u64,
    pub timeout_ms: u64,
    pub retry_max: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            mode: RerankerMode::None,
            local_model: None,
            adapter_path: None,
            cloud_endpoint: None,
            cloud_model: None,
            cloud_api_key: None,
            top_n: 10,
            batch_size: 16,
            max_length: 512,
            pool_size: None,
            reload_period_sec: 5,
            min_reload_interval_sec: 30,
            unload_after_sec: 300,
            timeout_ms: 5_000,
            retry_max: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub strategy: ChunkStrategy,
    /// Greedy window size, in tokens.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_chars: usize,
    pub max_chunk_tokens: usize,
    pub ast_overlap_lines: usize,
    pub preserve_imports: bool,
    pub summaries: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Hybrid,
            chunk_size: 400,
            chunk_overlap: 50,
            min_chunk_chars: 50,
            max_chunk_tokens: 800,
            ast_overlap_lines: 3,
            preserve_imports: true,
            summaries: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub embedder_concurrency: usize,
    pub max_indexable_file_size: u64,
    pub include_extensions: Vec<String>,
    pub ignore_globs: Vec<String>,
    pub write_batch_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            embedder_concurrency: 4,
            max_indexable_file_size: 1_048_576,
            include_extensions: [
                "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "c", "h", "cpp", "hpp", "rb",
                "md", "toml", "yaml", "yml", "json",
            ]
            .iter()
            .map(|ext| (*ext).to_owned())
            .collect(),
            ignore_globs: Vec::new(),
            write_batch_size: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub deadline_ms: u64,
    pub modality_timeout_ms: u64,
    pub cancel_grace_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            deadline_ms: 2_000,
            modality_timeout_ms: 1_500,
            cancel_grace_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub min_confidence: f32,
    pub holdout_fraction: f64,
    pub epsilon: f64,
    pub learning_rate: f64,
    pub epochs: usize,
    /// Ranks considered "high" when sampling a skipped chunk as a negative.
    pub negative_sample_rank: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            holdout_fraction: 0.2,
            epsilon: 0.01,
            learning_rate: 0.05,
            epochs: 200,
            negative_sample_rank: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub chat_model: Option<String>,
    pub embedding: EmbeddingConfig,
    pub vector_search: VectorSearchConfig,
    pub sparse_search: SparseSearchConfig,
    pub graph_search: GraphSearchConfig,
    pub fusion: FusionConfig,
    pub reranker: RerankerConfig,
    pub chunker: ChunkerConfig,
    pub indexer: IndexerConfig,
    pub search: SearchConfig,
    pub learning: LearningConfig,
}

impl AppConfig {
    /// Reject invalid or partial configuration before anything starts.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.embedding.dimension == 0 {
            return Err(AppError::Config("embedding.dimension must be > 0".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(AppError::Config("embedding.batch_size must be > 0".into()));
        }
        if self.embedding.provider == EmbeddingBackend::OpenAi
            && self.embedding.openai_api_key.is_none()
        {
            return Err(AppError::Config(
                "embedding.openai_api_key is required for the openai provider".into(),
            ));
        }
        if !self.vector_search.enabled && !self.sparse_search.enabled && !self.graph_search.enabled
        {
            return Err(AppError::Config(
                "at least one retrieval modality must be enabled".into(),
            ));
        }
        for (name, weight) in [
            ("fusion.vector_weight", self.fusion.vector_weight),
            ("fusion.sparse_weight", self.fusion.sparse_weight),
            ("fusion.graph_weight", self.fusion.graph_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AppError::Config(format!("{name} must be >= 0")));
            }
        }
        if self.fusion.rrf_k <= 0.0 {
            return Err(AppError::Config("fusion.rrf_k must be > 0".into()));
        }
        if self.fusion.final_k == 0 {
            return Err(AppError::Config("fusion.final_k must be > 0".into()));
        }
        if self.sparse_search.k1 <= 0.0 || !(0.0..=1.0).contains(&self.sparse_search.b) {
            return Err(AppError::Config(
                "sparse_search.k1 must be > 0 and sparse_search.b within [0, 1]".into(),
            ));
        }
        if self.chunker.chunk_size == 0 || self.chunker.chunk_overlap >= self.chunker.chunk_size {
            return Err(AppError::Config(
                "chunker.chunk_overlap must be smaller than chunker.chunk_size".into(),
            ));
        }
        if self.chunker.max_chunk_tokens < self.chunker.chunk_size {
            return Err(AppError::Config(
                "chunker.max_chunk_tokens must be >= chunker.chunk_size".into(),
            ));
        }
        if self.indexer.embedder_concurrency == 0 || self.indexer.write_batch_size == 0 {
            return Err(AppError::Config(
                "indexer.embedder_concurrency and indexer.write_batch_size must be > 0".into(),
            ));
        }
        if self.reranker.top_n == 0 || self.reranker.batch_size == 0 {
            return Err(AppError::Config(
                "reranker.top_n and reranker.batch_size must be > 0".into(),
            ));
        }
        if self.reranker.mode == RerankerMode::Cloud && self.reranker.cloud_endpoint.is_none() {
            return Err(AppError::Config(
                "reranker.cloud_endpoint is required for cloud mode".into(),
            ));
        }
        if self.reranker.mode == RerankerMode::Learned && self.reranker.adapter_path.is_none() {
            return Err(AppError::Config(
                "reranker.adapter_path is required for learned mode".into(),
            ));
        }
        if self.search.top_k == 0 || self.search.deadline_ms == 0 {
            return Err(AppError::Config(
                "search.top_k and search.deadline_ms must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.learning.holdout_fraction) {
            return Err(AppError::Config(
                "learning.holdout_fraction must be within [0, 1)".into(),
            ));
        }
        if self.learning.epsilon < 0.0 {
            return Err(AppError::Config("learning.epsilon must be >= 0".into()));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            data_dir: default_data_dir(),
            chat_model: None,
            embedding: EmbeddingConfig::default(),
            vector_search: VectorSearchConfig::default(),
            sparse_search: SparseSearchConfig::default(),
            graph_search: GraphSearchConfig::default(),
            fusion: FusionConfig::default(),
            reranker: RerankerConfig::default(),
            chunker: ChunkerConfig::default(),
            indexer: IndexerConfig::default(),
            search: SearchConfig::default(),
            learning: LearningConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_owned()
}

pub fn get_config() -> Result<AppConfig, AppError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()
        .map_err(|e| AppError::Config(e.to_string()))?;

    let config: AppConfig = config
        .try_deserialize()
        .map_err(|e| AppError::Config(e.to_string()))?;
    config.validate()?;

    Ok(config)
}
