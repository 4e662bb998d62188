use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::utils::config::{AppConfig, ChunkerConfig, SparseTokenizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Idle,
    Building,
    Complete,
    Error,
}

/// Per-corpus record of how the corpus was built. This is the authority for
/// the dimension-lock and tokenizer-lock invariants: a query whose embedder
/// or analyzer disagrees with the manifest must fail loudly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusManifest {
    pub corpus_id: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chunker: ChunkerConfig,
    pub sparse_tokenizer: SparseTokenizer,
    pub build_status: BuildStatus,
    pub error: Option<String>,
    pub last_built_at: Option<DateTime<Utc>>,
    /// Content hash per relative file path, for delta builds.
    pub file_hashes: BTreeMap<String, String>,
    pub triplet_count_at_last_train: u64,
    pub active_adapter: Option<String>,
}

impl CorpusManifest {
    pub fn new(corpus_id: String, config: &AppConfig) -> Self {
        Self {
            corpus_id,
            embedding_provider: format!("{:?}", config.embedding.provider).to_lowercase(),
            embedding_model: config.embedding.model.clone(),
            embedding_dimension: config.embedding.dimension,
            chunker: config.chunker.clone(),
            sparse_tokenizer: config.sparse_search.tokenizer,
            build_status: BuildStatus::Idle,
            error: None,
            last_built_at: None,
            file_hashes: BTreeMap::new(),
            triplet_count_at_last_train: 0,
            active_adapter: None,
        }
    }
}

/// Loads and stores corpus manifests as JSON files, committing through a
/// stage-and-rename so readers never observe a half-written manifest.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("manifests"),
        }
    }

    pub fn path(&self, corpus_id: &str) -> PathBuf {
        self.dir.join(format!("{corpus_id}.json"))
    }

    pub fn load(&self, corpus_id: &str) -> Result<Option<CorpusManifest>, AppError> {
        let path = self.path(corpus_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AppError::Io(err)),
        };
        let manifest: CorpusManifest = serde_json::from_slice(&bytes)?;
        Ok(Some(manifest))
    }

    pub fn store(&self, manifest: &CorpusManifest) -> Result<(), AppError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(&manifest.corpus_id);
        let staged = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(manifest)?;
        fs::write(&staged, bytes)?;
        fs::rename(&staged, &path)?;

        debug!(corpus_id = %manifest.corpus_id, path = %path.display(), "manifest committed");
        Ok(())
    }

    pub fn delete(&self, corpus_id: &str) -> Result<(), AppError> {
        let path = self.path(corpus_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(err)),
        }
    }
}
