use std::{
    collections::hash_map::DefaultHasher,
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use dashmap::DashMap;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    utils::{config::AppConfig, config::EmbeddingBackend, ids},
};

/// How long a caller waits on another in-flight embedding of the same text
/// before poll-checking the cache again.
const SINGLE_FLIGHT_POLL: Duration = Duration::from_millis(25);

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
    cache: Option<Arc<EmbeddingCache>>,
    batch_size: usize,
    retry_max: usize,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAi {
        client: Client<OpenAIConfig>,
        model: String,
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_code: String,
        dimension: usize,
    },
    /// Deterministic hashing backend for tests and offline smoke runs.
    Hashed { dimension: usize },
}

impl EmbeddingProvider {
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let inner = match config.embedding.provider {
            EmbeddingBackend::OpenAi => {
                let api_key = config.embedding.openai_api_key.clone().ok_or_else(|| {
                    AppError::Config("embedding.openai_api_key is required".into())
                })?;
                let client = Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&config.embedding.openai_base_url),
                );
                EmbeddingInner::OpenAi {
                    client,
                    model: config.embedding.model.clone(),
                    dimension: config.embedding.dimension,
                }
            }
            EmbeddingBackend::FastEmbed => {
                let model_name = EmbeddingModel::from_str(&config.embedding.model)
                    .map_err(|err| AppError::Config(format!("unknown fastembed model: {err}")))?;
                let options =
                    TextInitOptions::new(model_name.clone()).with_show_download_progress(false);
                let model_name_for_task = model_name.clone();
                let model_code = config.embedding.model.clone();

                let (model, dimension) =
                    tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                        let model = TextEmbedding::try_new(options)
                            .context("initialising FastEmbed text model")?;
                        let info = EmbeddingModel::get_model_info(&model_name_for_task)
                            .ok_or_else(|| anyhow!("FastEmbed model metadata missing"))?;
                        Ok((model, info.dim))
                    })
                    .await??;

                if dimension != config.embedding.dimension {
                    return Err(AppError::Config(format!(
                        "embedding.dimension {} disagrees with fastembed model dimension {}",
                        config.embedding.dimension, dimension
                    )));
                }

                EmbeddingInner::FastEmbed {
                    model: Arc::new(Mutex::new(model)),
                    model_code,
                    dimension,
                }
            }
            EmbeddingBackend::Hashed => EmbeddingInner::Hashed {
                dimension: config.embedding.dimension,
            },
        };

        let cache = if config.embedding.cache_enabled {
            let label = match &inner {
                EmbeddingInner::OpenAi { model, .. } => format!("openai-{model}"),
                EmbeddingInner::FastEmbed { model_code, .. } => format!("fastembed-{model_code}"),
                EmbeddingInner::Hashed { .. } => "hashed".to_owned(),
            };
            Some(Arc::new(EmbeddingCache::new(&config.data_dir, &label)))
        } else {
            None
        };

        Ok(Self {
            inner,
            cache,
            batch_size: config.embedding.batch_size,
            retry_max: config.embedding.retry_max,
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::OpenAi { .. } => "openai",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::Hashed { .. } => "hashed",
        }
    }

    pub fn model_code(&self) -> &str {
        match &self.inner {
            EmbeddingInner::OpenAi { model, .. } => model,
            EmbeddingInner::FastEmbed { model_code, .. } => model_code,
            EmbeddingInner::Hashed { .. } => "hashed",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::OpenAi { dimension, .. }
            | EmbeddingInner::FastEmbed { dimension, .. }
            | EmbeddingInner::Hashed { dimension } => *dimension,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[text.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::Upstream("no embedding returned for input".into()))
    }

    /// Embed a batch of texts, going through the content-addressed cache and
    /// de-duplicating concurrent upstream calls per `(model, text)`.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let Some(cache) = &self.cache else {
            let all: Vec<usize> = (0..texts.len()).collect();
            return self.fetch_missing(texts, &all).await;
        };

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut key_of: Vec<Option<String>> = vec![None; texts.len()];
        // Keys this call claimed, with the index whose text backs the fetch.
        // A repeated text within one batch must not wait on its own claim.
        let mut claimed: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        let mut missing: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = ids::content_hash(text);
            if claimed.contains_key(&key) {
                key_of[i] = Some(key);
                continue;
            }
            match cache.claim(&key).await? {
                CacheClaim::Hit(vector) => results[i] = Some(vector),
                CacheClaim::Claimed => {
                    claimed.insert(key.clone(), i);
                    key_of[i] = Some(key);
                    missing.push(i);
                }
            }
        }

        if missing.is_empty() {
            debug!(total = texts.len(), "embedding batch fully cached");
            return Ok(results.into_iter().flatten().collect());
        }

        let fetch_result = self.fetch_missing(texts, &missing).await;

        // Claims must be released on every path, or waiters would spin until
        // their poll loop takes the claim over.
        let mut fetched_by_key: std::collections::HashMap<String, Vec<f32>> =
            std::collections::HashMap::new();
        if let Ok(fetched) = &fetch_result {
            for (slot, vector) in missing.iter().zip(fetched.iter()) {
                let key = ids::content_hash(&texts[*slot]);
                if let Err(err) = cache.put(&key, vector) {
                    warn!(error = %err, "failed to persist embedding cache entry");
                }
                fetched_by_key.insert(key, vector.clone());
            }
        }
        for key in claimed.keys() {
            cache.release(key);
        }
        fetch_result?;

        for (i, slot) in results.iter_mut().enumerate() {
            if slot.is_none() {
                let vector = key_of[i]
                    .as_ref()
                    .and_then(|key| fetched_by_key.get(key).cloned());
                *slot = vector;
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn fetch_missing(
        &self,
        texts: &[String],
        missing: &[usize],
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let mut fetched = Vec::with_capacity(missing.len());
        for slice in missing.chunks(self.batch_size.max(1)) {
            let batch: Vec<String> = slice.iter().map(|&i| texts[i].clone()).collect();

            let retry_strategy = ExponentialBackoff::from_millis(100)
                .map(jitter)
                .take(self.retry_max);
            let vectors =
                Retry::spawn(retry_strategy, || self.fetch_batch(batch.clone())).await?;

            if vectors.len() != batch.len() {
                return Err(AppError::Upstream(format!(
                    "embedding backend returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for vector in &vectors {
                if vector.len() != self.dimension() {
                    return Err(AppError::Upstream(format!(
                        "embedding dimension {} does not match expected {}",
                        vector.len(),
                        self.dimension()
                    )));
                }
            }
            fetched.extend(vectors);
        }
        Ok(fetched)
    }

    async fn fetch_batch(&self, batch: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        match &self.inner {
            EmbeddingInner::OpenAi {
                client,
                model,
                dimension,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .dimensions(u32::try_from(*dimension).unwrap_or(u32::MAX))
                    .input(batch)
                    .build()?;

                let response = client.embeddings().create(request).await?;
                Ok(response
                    .data
                    .into_iter()
                    .map(|row| row.embedding)
                    .collect())
            }
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                guard
                    .embed(batch, None)
                    .map_err(|e| AppError::Upstream(e.to_string()))
            }
            EmbeddingInner::Hashed { dimension } => Ok(batch
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
        }
    }
}

enum CacheClaim {
    Hit(Vec<f32>),
    Claimed,
}

/// Content-addressed embedding cache. Disk entries are written via tempfile +
/// rename (idempotent inserts); the in-flight table gives per-key
/// single-flight so two concurrent builds never embed the same text twice.
struct EmbeddingCache {
    dir: PathBuf,
    inflight: DashMap<String, ()>,
}

impl EmbeddingCache {
    fn new(data_dir: impl AsRef<Path>, namespace: &str) -> Self {
        let sanitized: String = namespace
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
            .collect();
        Self {
            dir: data_dir.as_ref().join("cache").join("embeddings").join(sanitized),
            inflight: DashMap::new(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let shard = key.get(0..2).unwrap_or("00");
        self.dir.join(shard).join(format!("{key}.json"))
    }

    fn read(&self, key: &str) -> Result<Option<Vec<f32>>, AppError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AppError::Io(err)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(vector) => Ok(Some(vector)),
            Err(err) => {
                // Corrupt entries are dropped and re-embedded.
                warn!(key, error = %err, "dropping unreadable embedding cache entry");
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Either return the cached vector or claim the key for this caller.
    /// While another caller holds the claim, waits until the entry lands (or
    /// the claim is released, in which case this caller takes over).
    async fn claim(&self, key: &str) -> Result<CacheClaim, AppError> {
        loop {
            if let Some(vector) = self.read(key)? {
                return Ok(CacheClaim::Hit(vector));
            }
            match self.inflight.entry(key.to_owned()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(());
                    return Ok(CacheClaim::Claimed);
                }
                dashmap::mapref::entry::Entry::Occupied(_) => {}
            }
            tokio::time::sleep(SINGLE_FLIGHT_POLL).await;
        }
    }

    fn put(&self, key: &str, vector: &[f32]) -> Result<(), AppError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_vec(vector)?)?;
        fs::rename(&staged, &path)?;
        Ok(())
    }

    fn release(&self, key: &str) {
        self.inflight.remove(key);
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];

    for token in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if token.is_empty() {
            continue;
        }
        let mut hasher = DefaultHasher::new();
        token.to_ascii_lowercase().hash(&mut hasher);
        let idx = (hasher.finish() % dim as u64) as usize;
        vector[idx] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::AppConfig;
    use tempfile::TempDir;

    fn hashed_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.data_dir = dir.path().to_string_lossy().into_owned();
        config.embedding.provider = EmbeddingBackend::Hashed;
        config.embedding.dimension = 16;
        config
    }

    #[tokio::test]
    async fn hashed_backend_is_deterministic() {
        let dir = TempDir::new().expect("tempdir");
        let provider = EmbeddingProvider::from_config(&hashed_config(&dir))
            .await
            .expect("provider");

        let a = provider.embed("fn login() {}").await.expect("embed");
        let b = provider.embed("fn login() {}").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let dir = TempDir::new().expect("tempdir");
        let provider = EmbeddingProvider::from_config(&hashed_config(&dir))
            .await
            .expect("provider");

        let texts = vec!["alpha".to_owned(), "beta".to_owned(), "alpha".to_owned()];
        let vectors = provider.embed_batch(&texts).await.expect("embed batch");

        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn cache_entries_land_on_disk_and_hit_on_reembed() {
        let dir = TempDir::new().expect("tempdir");
        let provider = EmbeddingProvider::from_config(&hashed_config(&dir))
            .await
            .expect("provider");

        let first = provider.embed("cached text").await.expect("embed");

        let cache_root = dir.path().join("cache").join("embeddings");
        let entries = walk_json_files(&cache_root).len();
        assert_eq!(entries, 1, "expected exactly one cache entry");

        let second = provider.embed("cached text").await.expect("embed again");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cache_claim_blocks_second_caller_until_release() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(EmbeddingCache::new(dir.path(), "test"));

        let claim = cache.claim("deadbeef").await.expect("claim");
        assert!(matches!(claim, CacheClaim::Claimed));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.claim("deadbeef").await })
        };

        // Give the waiter time to park on the in-flight entry.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!waiter.is_finished(), "waiter should block on the claim");

        cache.put("deadbeef", &[1.0, 2.0]).expect("put");
        cache.release("deadbeef");

        let outcome = waiter.await.expect("join").expect("claim");
        match outcome {
            CacheClaim::Hit(vector) => assert_eq!(vector, vec![1.0, 2.0]),
            CacheClaim::Claimed => panic!("waiter should observe the cached vector"),
        }
    }

    #[tokio::test]
    async fn failed_owner_claim_is_taken_over() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(EmbeddingCache::new(dir.path(), "test"));

        let claim = cache.claim("cafe").await.expect("claim");
        assert!(matches!(claim, CacheClaim::Claimed));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.claim("cafe").await })
        };

        // Owner fails without writing; releasing hands the key to the waiter.
        cache.release("cafe");

        let outcome = waiter.await.expect("join").expect("claim");
        assert!(matches!(outcome, CacheClaim::Claimed));
    }

    fn walk_json_files(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    found.push(path);
                }
            }
        }
        found
    }
}
