use serde_json::json;
use tracing::debug;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::Chunk},
    utils::config::SparseSearchConfig,
};

use crate::{ChunkMatch, MatchSource};

/// BM25 retrieval over the chunk full-text index. `k1`/`b` and the analyzer
/// are baked into the index at build time; the manifest pins the tokenizer so
/// queries cannot silently disagree with the build.
pub async fn retrieve(
    db: &SurrealDbClient,
    corpus_id: &str,
    query: &str,
    config: &SparseSearchConfig,
) -> Result<Vec<ChunkMatch>, AppError> {
    let results = Chunk::fts_search(config.topk_sparse, query, db, corpus_id).await?;

    let matches = results
        .into_iter()
        .enumerate()
        .map(|(i, row)| ChunkMatch {
            chunk_id: row.chunk.id.clone(),
            score: row.score,
            source: MatchSource::Sparse,
            rank_within_source: i + 1,
            fused_score: None,
            chunk: row.chunk,
            metadata: json!({ "bm25": row.score }),
        })
        .collect::<Vec<_>>();

    debug!(corpus_id, results = matches.len(), "sparse retrieval complete");
    Ok(matches)
}
