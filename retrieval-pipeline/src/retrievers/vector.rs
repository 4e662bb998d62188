use serde_json::json;
use tracing::debug;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::Chunk},
    utils::config::VectorSearchConfig,
};

use crate::{ChunkMatch, MatchSource};

/// Approximate nearest-neighbour retrieval over chunk embeddings. The query
/// embedding is produced by the orchestrator with the same embedder that
/// built the corpus; the dimension-lock check has already passed by the time
/// this runs.
pub async fn retrieve(
    db: &SurrealDbClient,
    corpus_id: &str,
    query_embedding: Vec<f32>,
    config: &VectorSearchConfig,
) -> Result<Vec<ChunkMatch>, AppError> {
    let results = Chunk::vector_search(config.topk_dense, query_embedding, db, corpus_id).await?;

    let mut matches = Vec::with_capacity(results.len());
    for row in results {
        if row.score < config.similarity_threshold {
            continue;
        }
        let rank = matches.len() + 1;
        matches.push(ChunkMatch {
            chunk_id: row.chunk.id.clone(),
            score: row.score,
            source: MatchSource::Vector,
            rank_within_source: rank,
            fused_score: None,
            chunk: row.chunk,
            metadata: json!({ "similarity": row.score }),
        });
    }

    debug!(corpus_id, results = matches.len(), "vector retrieval complete");
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::utils::config::{SparseSearchConfig, SparseTokenizer};
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("vector_test_ns", &database)
            .await
            .expect("failed to start in-memory surrealdb");
        let sparse = SparseSearchConfig {
            tokenizer: SparseTokenizer::Whitespace,
            ..SparseSearchConfig::default()
        };
        ensure_runtime_indexes(&db, 3, &sparse)
            .await
            .expect("indexes");
        db
    }

    fn chunk(path: &str, content: &str) -> Chunk {
        Chunk::new(
            "c1".into(),
            path.into(),
            1,
            20,
            Some("python".into()),
            content.into(),
            5,
            false,
        )
    }

    #[tokio::test]
    async fn ranks_by_cosine_similarity() {
        let db = setup_db().await;
        Chunk::store_with_embedding(chunk("a.py", "def login(): pass"), vec![1.0, 0.0, 0.0], &db)
            .await
            .expect("store a");
        Chunk::store_with_embedding(chunk("b.py", "def logout(): pass"), vec![0.0, 1.0, 0.0], &db)
            .await
            .expect("store b");

        let config = VectorSearchConfig::default();
        let matches = retrieve(&db, "c1", vec![0.9, 0.1, 0.0], &config)
            .await
            .expect("retrieve");

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].chunk.file_path, "a.py");
        assert_eq!(matches[0].rank_within_source, 1);
        assert_eq!(matches[1].rank_within_source, 2);
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn similarity_threshold_filters_low_scores() {
        let db = setup_db().await;
        Chunk::store_with_embedding(chunk("a.py", "def login(): pass"), vec![1.0, 0.0, 0.0], &db)
            .await
            .expect("store a");
        Chunk::store_with_embedding(chunk("b.py", "def logout(): pass"), vec![0.0, 1.0, 0.0], &db)
            .await
            .expect("store b");

        let config = VectorSearchConfig {
            similarity_threshold: 0.5,
            ..VectorSearchConfig::default()
        };
        let matches = retrieve(&db, "c1", vec![1.0, 0.0, 0.0], &config)
            .await
            .expect("retrieve");

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk.file_path, "a.py");
    }
}
