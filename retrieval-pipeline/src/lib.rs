#![allow(clippy::missing_docs_in_private_items)]

pub mod fusion;
pub mod pipeline;
pub mod reranker;
pub mod retrievers;

use serde::{Deserialize, Serialize};

use common::storage::types::chunk::Chunk;
use common::utils::config::FusionMethod;

/// Which stage produced a match's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Vector,
    Sparse,
    Graph,
    Fused,
    Reranked,
}

/// A query-time result row. `score` lives in the score space of `source`;
/// after reranking the fusion score survives in `fused_score`.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub score: f32,
    pub source: MatchSource,
    /// 1-based rank within the list that produced this row.
    pub rank_within_source: usize,
    pub fused_score: Option<f32>,
    pub chunk: Chunk,
    /// Backend-specific debug fields.
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub corpus_id: String,
    pub top_k: Option<usize>,
    pub include_vector: bool,
    pub include_sparse: bool,
    pub include_graph: bool,
    pub deadline_ms: Option<u64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, corpus_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            corpus_id: corpus_id.into(),
            top_k: None,
            include_vector: true,
            include_sparse: true,
            include_graph: true,
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "detail")]
pub enum ModalityStatus {
    Ok { results: usize },
    Disabled,
    Timeout,
    Error,
}

impl ModalityStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Disabled modalities never count against partial-success policy.
    pub fn failed(&self) -> bool {
        matches!(self, Self::Timeout | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PerModalityStatus {
    pub vector: ModalityStatus,
    pub sparse: ModalityStatus,
    pub graph: ModalityStatus,
}

/// Wall-clock per stage, for response metadata.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub embed_ms: u128,
    pub retrieve_ms: u128,
    pub fuse_ms: u128,
    pub rerank_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<ChunkMatch>,
    pub fusion_method: FusionMethod,
    /// Configured reranker mode, or "degraded" when it was unavailable.
    pub reranker_mode: String,
    pub latency_ms: u128,
    pub per_modality_status: PerModalityStatus,
    pub stage_timings: StageTimings,
}

pub use pipeline::RetrievalPipeline;
