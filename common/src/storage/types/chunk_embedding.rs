use surrealdb::RecordId;

use crate::storage::types::chunk::Chunk;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ChunkEmbedding, "chunk_embedding", {
    /// Record link to the owning chunk
    chunk_id: RecordId,
    /// Denormalized corpus id for scoped search and bulk deletes
    corpus_id: String,
    /// Embedding vector; dimension is locked by the corpus manifest
    embedding: Vec<f32>
});

impl ChunkEmbedding {
    /// `chunk_key` is the **key** part of the chunk id, not "chunk:key".
    /// The embedding row reuses it, keeping the mapping 1:1.
    pub fn new(chunk_key: &str, corpus_id: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();

        Self {
            id: chunk_key.to_owned(),
            created_at: now,
            updated_at: now,
            chunk_id: RecordId::from_table_key(Chunk::table_name(), chunk_key),
            corpus_id,
            embedding,
        }
    }

    pub async fn get_by_chunk_id(
        chunk_id: &RecordId,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let query = format!(
            "SELECT * FROM {} WHERE chunk_id = $chunk_id LIMIT 1",
            Self::table_name()
        );

        let mut result = db
            .client
            .query(query)
            .bind(("chunk_id", chunk_id.clone()))
            .await
            .map_err(AppError::Database)?;

        let embeddings: Vec<Self> = result.take(0).map_err(AppError::Database)?;

        Ok(embeddings.into_iter().next())
    }
}
