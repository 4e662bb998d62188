use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use common::{
    error::AppError,
    manifest::{CorpusManifest, ManifestStore},
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};

use crate::{
    fusion::{self, FusionInputs},
    reranker::Reranker,
    retrievers::{graph, sparse, vector},
    ChunkMatch, ModalityStatus, PerModalityStatus, SearchRequest, SearchResponse, StageTimings,
};

/// Query entry point: validates, checks the manifest locks, scatters the
/// enabled retrievers under per-modality deadlines, fuses, reranks, truncates.
pub struct RetrievalPipeline {
    db: Arc<SurrealDbClient>,
    provider: Arc<EmbeddingProvider>,
    manifests: ManifestStore,
    reranker: Arc<Reranker>,
    config: AppConfig,
}

impl RetrievalPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        provider: Arc<EmbeddingProvider>,
        reranker: Arc<Reranker>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            provider,
            manifests: ManifestStore::new(&config.data_dir),
            reranker,
            config,
        }
    }

    #[instrument(skip_all, fields(corpus_id = %request.corpus_id))]
    pub async fn search(
        &self,
        request: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse, AppError> {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        if cancel.is_cancelled() {
            return Err(AppError::UpstreamTimeout("query cancelled".into()));
        }
        self.validate(&request)?;
        self.load_checked_manifest(&request)?;

        let deadline = Duration::from_millis(
            request.deadline_ms.unwrap_or(self.config.search.deadline_ms),
        );
        let modality_timeout = Duration::from_millis(self.config.search.modality_timeout_ms)
            .min(deadline)
            .max(Duration::from_millis(1));

        let enable_vector = self.config.vector_search.enabled && request.include_vector;
        let enable_sparse = self.config.sparse_search.enabled && request.include_sparse;
        let enable_graph = self.config.graph_search.enabled && request.include_graph;
        if !enable_vector && !enable_sparse && !enable_graph {
            return Err(AppError::Validation(
                "all retrieval modalities are disabled for this query".into(),
            ));
        }

        // One query embedding serves both the vector and graph retrievers;
        // its failure demotes those modalities, never the whole query.
        let embed_started = Instant::now();
        let query_embedding = if enable_vector || enable_graph {
            let embed = timeout(modality_timeout, self.provider.embed(&request.query));
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::UpstreamTimeout("query cancelled".into()));
                }
                result = embed => match result {
                    Ok(Ok(vector)) => Some(vector),
                    Ok(Err(err)) => {
                        warn!(error = %err, "query embedding failed; demoting dense modalities");
                        None
                    }
                    Err(_) => {
                        warn!("query embedding timed out; demoting dense modalities");
                        None
                    }
                },
            }
        } else {
            None
        };
        timings.embed_ms = embed_started.elapsed().as_millis();

        let retrieve_started = Instant::now();
        let scatter = self.scatter(
            &request,
            query_embedding,
            enable_vector,
            enable_sparse,
            enable_graph,
            modality_timeout,
        );
        let (vector_out, sparse_out, graph_out) = tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the scatter future tears down all three in-flight
                // retrievals well within the grace window.
                return Err(AppError::UpstreamTimeout("query cancelled".into()));
            }
            results = scatter => results,
        };
        timings.retrieve_ms = retrieve_started.elapsed().as_millis();

        let status = PerModalityStatus {
            vector: vector_out.0,
            sparse: sparse_out.0,
            graph: graph_out.0,
        };

        let enabled_statuses = [
            (enable_vector, status.vector),
            (enable_sparse, status.sparse),
            (enable_graph, status.graph),
        ];
        let all_failed = enabled_statuses
            .iter()
            .filter(|(enabled, _)| *enabled)
            .all(|(_, s)| s.failed());
        if all_failed {
            return Err(AppError::AllRetrieversFailed);
        }

        let fuse_started = Instant::now();
        let inputs = FusionInputs {
            vector: enable_vector.then_some(vector_out.1),
            sparse: enable_sparse.then_some(sparse_out.1),
            graph: enable_graph.then_some(graph_out.1),
        };
        let fused = fusion::fuse(inputs, &self.config.fusion);
        timings.fuse_ms = fuse_started.elapsed().as_millis();
        debug!(candidates = fused.len(), "fusion complete");

        let rerank_started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::UpstreamTimeout("query cancelled".into()));
            }
            outcome = self.reranker.rerank(&request.query, fused) => outcome,
        };
        timings.rerank_ms = rerank_started.elapsed().as_millis();

        let top_k = request.top_k.unwrap_or(self.config.search.top_k).max(1);
        let mut matches = outcome.matches;
        matches.truncate(top_k);

        let latency_ms = started.elapsed().as_millis();
        info!(
            corpus_id = %request.corpus_id,
            results = matches.len(),
            latency_ms,
            reranker = %outcome.mode_label,
            "search complete"
        );

        Ok(SearchResponse {
            matches,
            fusion_method: self.config.fusion.method,
            reranker_mode: outcome.mode_label,
            latency_ms,
            per_modality_status: status,
            stage_timings: timings,
        })
    }

    fn validate(&self, request: &SearchRequest) -> Result<(), AppError> {
        if request.query.trim().is_empty() {
            return Err(AppError::Validation("query must not be empty".into()));
        }
        if request.corpus_id.trim().is_empty() {
            return Err(AppError::Validation("corpus_id must not be empty".into()));
        }
        if request.top_k == Some(0) {
            return Err(AppError::Validation("top_k must be greater than zero".into()));
        }
        Ok(())
    }

    /// Load the manifest and enforce the dimension and tokenizer locks before
    /// any retriever call. Disagreement fails the query loudly; silently
    /// returning wrong matches is the one unforgivable outcome here.
    fn load_checked_manifest(&self, request: &SearchRequest) -> Result<CorpusManifest, AppError> {
        let manifest = self
            .manifests
            .load(&request.corpus_id)?
            .ok_or_else(|| {
                AppError::NotFound(format!("corpus {} has no manifest", request.corpus_id))
            })?;
        if manifest.last_built_at.is_none() {
            return Err(AppError::NotFound(format!(
                "corpus {} has never completed a build",
                request.corpus_id
            )));
        }

        if manifest.embedding_dimension != self.provider.dimension() {
            return Err(AppError::ManifestMismatch(format!(
                "corpus {} was built at dimension {}, embedder produces {}",
                request.corpus_id,
                manifest.embedding_dimension,
                self.provider.dimension()
            )));
        }
        if self.config.sparse_search.enabled
            && request.include_sparse
            && manifest.sparse_tokenizer != self.config.sparse_search.tokenizer
        {
            return Err(AppError::ManifestMismatch(format!(
                "corpus {} was indexed with the {} tokenizer, query is configured for {}",
                request.corpus_id, manifest.sparse_tokenizer, self.config.sparse_search.tokenizer
            )));
        }

        Ok(manifest)
    }

    /// Run the enabled retrievers concurrently, each under its own
    /// sub-deadline. Failures and timeouts demote a modality to empty.
    async fn scatter(
        &self,
        request: &SearchRequest,
        query_embedding: Option<Vec<f32>>,
        enable_vector: bool,
        enable_sparse: bool,
        enable_graph: bool,
        modality_timeout: Duration,
    ) -> (
        (ModalityStatus, Vec<ChunkMatch>),
        (ModalityStatus, Vec<ChunkMatch>),
        (ModalityStatus, Vec<ChunkMatch>),
    ) {
        let vector_embedding = query_embedding.clone();
        let graph_embedding = query_embedding;

        let vector_task = async {
            if !enable_vector {
                return (ModalityStatus::Disabled, Vec::new());
            }
            let Some(embedding) = vector_embedding else {
                return (ModalityStatus::Error, Vec::new());
            };
            collect(
                "vector",
                timeout(
                    modality_timeout,
                    vector::retrieve(
                        &self.db,
                        &request.corpus_id,
                        embedding,
                        &self.config.vector_search,
                    ),
                )
                .await,
            )
        };

        let sparse_task = async {
            if !enable_sparse {
                return (ModalityStatus::Disabled, Vec::new());
            }
            collect(
                "sparse",
                timeout(
                    modality_timeout,
                    sparse::retrieve(
                        &self.db,
                        &request.corpus_id,
                        &request.query,
                        &self.config.sparse_search,
                    ),
                )
                .await,
            )
        };

        let graph_task = async {
            if !enable_graph {
                return (ModalityStatus::Disabled, Vec::new());
            }
            collect(
                "graph",
                timeout(
                    modality_timeout,
                    graph::retrieve(
                        &self.db,
                        &request.corpus_id,
                        &request.query,
                        graph_embedding,
                        &self.config.graph_search,
                    ),
                )
                .await,
            )
        };

        tokio::join!(vector_task, sparse_task, graph_task)
    }
}

/// Demotion policy in one place: a timeout or error becomes an empty result
/// with its status recorded; the query itself keeps going.
fn collect(
    modality: &str,
    outcome: Result<Result<Vec<ChunkMatch>, AppError>, tokio::time::error::Elapsed>,
) -> (ModalityStatus, Vec<ChunkMatch>) {
    match outcome {
        Ok(Ok(matches)) => (
            ModalityStatus::Ok {
                results: matches.len(),
            },
            matches,
        ),
        Ok(Err(err)) => {
            warn!(modality, error = %err, "retriever failed; demoting to empty");
            (ModalityStatus::Error, Vec::new())
        }
        Err(_) => {
            warn!(modality, "retriever exceeded its sub-deadline; demoting to empty");
            (ModalityStatus::Timeout, Vec::new())
        }
    }
}
