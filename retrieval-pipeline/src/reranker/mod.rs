pub mod adapter;
pub mod cloud;

use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use fastembed::{RerankInitOptions, TextRerank};
use serde_json::json;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::{
    error::AppError,
    utils::config::{RerankerConfig, RerankerMode},
};

use crate::{ChunkMatch, MatchSource};
use adapter::{AdapterSlot, RerankFeatures};
use cloud::CloudReranker;

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Pool of local cross-encoder engines. The semaphore bounds concurrent
/// scoring; engines are picked round-robin.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
    /// Waiting longer than this for a free engine is a capacity error, which
    /// callers may retry or degrade on.
    acquire_timeout: std::time::Duration,
}

impl RerankerPool {
    pub fn from_config(config: &RerankerConfig, data_dir: &str) -> Result<Arc<Self>, AppError> {
        let pool_size = config.pool_size.unwrap_or_else(default_pool_size);
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranker.pool_size must be greater than zero".to_string(),
            ));
        }

        let mut options = RerankInitOptions::default();
        let cache_dir = Path::new(data_dir).join("fastembed").join("reranker");
        fs::create_dir_all(&cache_dir)?;
        options.cache_dir = cache_dir;
        options.show_download_progress = false;
        options.max_length = config.max_length;

        let mut engines = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            debug!(engine = i, "creating reranking engine");
            let model = TextRerank::try_new(options.clone())
                .map_err(|e| AppError::RerankerUnavailable(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            batch_size: config.batch_size,
            acquire_timeout: std::time::Duration::from_millis(config.timeout_ms.max(1)),
        }))
    }

    /// Check out capacity and an engine; the lease enforces backpressure.
    pub async fn checkout(self: &Arc<Self>) -> Result<RerankerLease, AppError> {
        let acquire = self.semaphore.clone().acquire_owned();
        let permit = tokio::time::timeout(self.acquire_timeout, acquire)
            .await
            .map_err(|_| AppError::Capacity("reranker pool saturated".into()))?
            .map_err(|_| AppError::RerankerUnavailable("reranker pool closed".into()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = Arc::clone(&self.engines[idx]);

        Ok(RerankerLease {
            _permit: permit,
            engine,
            batch_size: self.batch_size,
        })
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Active lease on a single cross-encoder engine.
pub struct RerankerLease {
    // Dropping releases the semaphore permit.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
    batch_size: usize,
}

impl RerankerLease {
    /// Scores aligned with `documents` order.
    pub async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let total = documents.len();
        let mut guard = self.engine.lock().await;
        let results = guard
            .rerank(query.to_owned(), documents, false, Some(self.batch_size))
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        let mut scores = vec![0.0f32; total];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

#[derive(Debug)]
pub struct RerankOutcome {
    pub matches: Vec<ChunkMatch>,
    /// Mode actually applied: the configured mode, or "degraded" when the
    /// reranker was unavailable and fused ordering was returned instead.
    pub mode_label: String,
    pub degraded: bool,
}

/// Cross-encoder reranking with four modes. Reranking never changes the
/// candidate set, only its order and the truncation to `top_n`.
pub struct Reranker {
    mode: RerankerMode,
    config: RerankerConfig,
    pool: Option<Arc<RerankerPool>>,
    adapter: Option<Arc<AdapterSlot>>,
    cloud: Option<CloudReranker>,
}

impl Reranker {
    pub fn from_config(config: &RerankerConfig, data_dir: &str) -> Result<Self, AppError> {
        let pool = match config.mode {
            RerankerMode::Local | RerankerMode::Learned => {
                Some(RerankerPool::from_config(config, data_dir)?)
            }
            RerankerMode::None | RerankerMode::Cloud => None,
        };
        let adapter = match config.mode {
            RerankerMode::Learned => {
                let path = config.adapter_path.clone().ok_or_else(|| {
                    AppError::Config("reranker.adapter_path is required for learned mode".into())
                })?;
                Some(AdapterSlot::new(Path::new(&path).join("weights.json")))
            }
            _ => None,
        };
        let cloud = match config.mode {
            RerankerMode::Cloud => Some(CloudReranker::from_config(config)?),
            _ => None,
        };

        Ok(Self {
            mode: config.mode,
            config: config.clone(),
            pool,
            adapter,
            cloud,
        })
    }

    pub fn mode(&self) -> RerankerMode {
        self.mode
    }

    /// Start the adapter fingerprint watcher (learned mode only).
    pub fn spawn_adapter_watcher(
        &self,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let slot = self.adapter.as_ref()?;
        Some(slot.spawn_watcher(
            std::time::Duration::from_secs(self.config.reload_period_sec),
            std::time::Duration::from_secs(self.config.min_reload_interval_sec),
            std::time::Duration::from_secs(self.config.unload_after_sec),
            cancel,
        ))
    }

    #[cfg(test)]
    pub(crate) fn adapter_slot(&self) -> Option<Arc<AdapterSlot>> {
        self.adapter.as_ref().map(Arc::clone)
    }

    /// Rerank the fused list. Unavailability degrades to the fused ordering
    /// rather than failing the query.
    pub async fn rerank(&self, query: &str, fused: Vec<ChunkMatch>) -> RerankOutcome {
        if self.mode == RerankerMode::None || fused.len() <= 1 {
            return RerankOutcome {
                matches: fused,
                mode_label: self.mode.to_string(),
                degraded: false,
            };
        }

        let documents: Vec<String> = fused.iter().map(|m| m.chunk.content.clone()).collect();

        match self.mode {
            RerankerMode::None => unreachable!("handled above"),
            RerankerMode::Local => match self.base_scores(query, documents).await {
                Ok(scores) => RerankOutcome {
                    matches: apply_scores(fused, &scores, self.config.top_n, None),
                    mode_label: self.mode.to_string(),
                    degraded: false,
                },
                Err(err) => self.degrade(fused, err),
            },
            RerankerMode::Learned => {
                let base = match self.base_scores(query, documents).await {
                    Ok(scores) => scores,
                    Err(err) => return self.degrade(fused, err),
                };
                let slot = match &self.adapter {
                    Some(slot) => slot,
                    None => {
                        return self.degrade(
                            fused,
                            AppError::RerankerUnavailable("no adapter slot".into()),
                        )
                    }
                };
                match slot.lease().await {
                    Ok(lease) => {
                        let scores: Vec<f32> = fused
                            .iter()
                            .zip(base.iter())
                            .map(|(item, base_score)| {
                                let features = RerankFeatures::compute(
                                    query,
                                    &item.chunk.content,
                                    *base_score,
                                );
                                lease.weights.score(&features)
                            })
                            .collect();
                        let annotation = json!({
                            "adapter_fingerprint": lease.fingerprint,
                            "adapter_version": lease.version,
                        });
                        RerankOutcome {
                            matches: apply_scores(
                                fused,
                                &scores,
                                self.config.top_n,
                                Some(&annotation),
                            ),
                            mode_label: self.mode.to_string(),
                            degraded: false,
                        }
                    }
                    Err(err) => {
                        // Base model still works; score without the adapter
                        // but flag the degradation.
                        warn!(error = %err, "adapter unavailable; scoring with base model only");
                        RerankOutcome {
                            matches: apply_scores(fused, &base, self.config.top_n, None),
                            mode_label: "degraded".to_string(),
                            degraded: true,
                        }
                    }
                }
            }
            RerankerMode::Cloud => {
                let Some(cloud) = &self.cloud else {
                    return self.degrade(
                        fused,
                        AppError::RerankerUnavailable("cloud reranker not configured".into()),
                    );
                };
                match cloud.rerank(query, &documents).await {
                    Ok(scores) => RerankOutcome {
                        matches: apply_scores(fused, &scores, self.config.top_n, None),
                        mode_label: self.mode.to_string(),
                        degraded: false,
                    },
                    Err(err) => self.degrade(fused, err),
                }
            }
        }
    }

    async fn base_scores(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| AppError::RerankerUnavailable("no local engine pool".into()))?;
        let lease = pool.checkout().await?;
        lease.score(query, documents).await
    }

    fn degrade(&self, fused: Vec<ChunkMatch>, err: AppError) -> RerankOutcome {
        warn!(error = %err, "reranker unavailable; returning fused ordering");
        RerankOutcome {
            matches: fused,
            mode_label: "degraded".to_string(),
            degraded: true,
        }
    }
}

/// Reorder by the new scores and truncate to `top_n`. The input set is never
/// extended: the output is a permutation of a prefix-by-score of the input.
/// Fusion scores survive in the sidecar field.
fn apply_scores(
    fused: Vec<ChunkMatch>,
    scores: &[f32],
    top_n: usize,
    annotation: Option<&serde_json::Value>,
) -> Vec<ChunkMatch> {
    let mut rescored: Vec<ChunkMatch> = fused
        .into_iter()
        .zip(scores.iter())
        .map(|(mut item, score)| {
            item.fused_score = item.fused_score.or(Some(item.score));
            item.score = *score;
            item.source = MatchSource::Reranked;
            if let Some(object) = item.metadata.as_object_mut() {
                object.insert("rerank_score".into(), json!(score));
                if let Some(annotation) = annotation {
                    object.insert("adapter".into(), annotation.clone());
                }
            }
            item
        })
        .collect();

    rescored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    rescored.truncate(top_n.max(1));
    for (i, item) in rescored.iter_mut().enumerate() {
        item.rank_within_source = i + 1;
    }
    rescored
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::Chunk;
    use std::collections::HashSet;

    fn fused_entry(path: &str, fused_score: f32) -> ChunkMatch {
        let chunk = Chunk::new(
            "c1".into(),
            path.into(),
            1,
            10,
            Some("python".into()),
            format!("content of {path}"),
            5,
            false,
        );
        ChunkMatch {
            chunk_id: chunk.id.clone(),
            score: fused_score,
            source: MatchSource::Fused,
            rank_within_source: 1,
            fused_score: Some(fused_score),
            chunk,
            metadata: json!({}),
        }
    }

    #[test]
    fn rerank_is_a_pure_reordering_of_the_input_set() {
        let fused = vec![
            fused_entry("a.py", 0.9),
            fused_entry("b.py", 0.8),
            fused_entry("c.py", 0.7),
        ];
        let input_ids: HashSet<String> = fused.iter().map(|m| m.chunk_id.clone()).collect();

        let out = apply_scores(fused, &[0.1, 0.9, 0.5], 10, None);

        let output_ids: HashSet<String> = out.iter().map(|m| m.chunk_id.clone()).collect();
        assert_eq!(input_ids, output_ids, "no chunk invented or dropped");
        assert_eq!(out[0].chunk.file_path, "b.py");
        assert_eq!(out[1].chunk.file_path, "c.py");
        assert_eq!(out[2].chunk.file_path, "a.py");
    }

    #[test]
    fn truncation_keeps_top_n_by_new_score() {
        let fused = vec![
            fused_entry("a.py", 0.9),
            fused_entry("b.py", 0.8),
            fused_entry("c.py", 0.7),
        ];
        let out = apply_scores(fused, &[0.2, 0.9, 0.5], 2, None);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk.file_path, "b.py");
        assert_eq!(out[0].rank_within_source, 1);
        assert_eq!(out[1].rank_within_source, 2);
    }

    #[test]
    fn fusion_score_survives_in_sidecar() {
        let fused = vec![fused_entry("a.py", 0.42)];
        let out = apply_scores(fused, &[0.99], 5, None);

        assert_eq!(out[0].source, MatchSource::Reranked);
        assert!((out[0].score - 0.99).abs() < 1e-6);
        assert_eq!(out[0].fused_score, Some(0.42));
    }

    #[test]
    fn adapter_annotation_lands_in_metadata() {
        let fused = vec![fused_entry("a.py", 0.4)];
        let annotation = json!({ "adapter_fingerprint": "abc", "adapter_version": 3 });
        let out = apply_scores(fused, &[0.5], 5, Some(&annotation));

        assert_eq!(out[0].metadata["adapter"]["adapter_version"], 3);
    }

    #[tokio::test]
    async fn none_mode_is_identity() {
        let config = RerankerConfig::default();
        let reranker = Reranker::from_config(&config, "./data").expect("reranker");
        let fused = vec![fused_entry("a.py", 0.9), fused_entry("b.py", 0.8)];
        let ids: Vec<String> = fused.iter().map(|m| m.chunk_id.clone()).collect();

        let outcome = reranker.rerank("query", fused).await;

        assert!(!outcome.degraded);
        assert_eq!(outcome.mode_label, "none");
        let out_ids: Vec<String> = outcome.matches.iter().map(|m| m.chunk_id.clone()).collect();
        assert_eq!(ids, out_ids, "identity mode must not reorder");
    }
}
