use crate::storage::types::chunk_embedding::ChunkEmbedding;
use crate::utils::ids;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Chunk, "chunk", {
    corpus_id: String,
    file_path: String,
    start_line: u32,
    end_line: u32,
    language: Option<String>,
    content: String,
    token_count: u32,
    content_hash: String,
    summary: Option<String>,
    /// Set when the chunk still exceeded the token budget after all splitting.
    truncated: bool
});

/// Search result including hydrated chunk.
#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ChunkSearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        corpus_id: String,
        file_path: String,
        start_line: u32,
        end_line: u32,
        language: Option<String>,
        content: String,
        token_count: u32,
        truncated: bool,
    ) -> Self {
        let now = Utc::now();
        let content_hash = ids::content_hash(&content);
        let id = ids::chunk_id(&corpus_id, &file_path, start_line, end_line, &content_hash);
        Self {
            id,
            created_at: now,
            updated_at: now,
            corpus_id,
            file_path,
            start_line,
            end_line,
            language,
            content,
            token_count,
            content_hash,
            summary: None,
            truncated,
        }
    }

    /// Atomically store a chunk and its embedding vector.
    pub async fn store_with_embedding(
        chunk: Chunk,
        embedding: Vec<f32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let emb = ChunkEmbedding::new(&chunk.id, chunk.corpus_id.clone(), embedding);

        // Create both records in a single transaction so neither is orphaned.
        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "UPSERT type::thing('{chunk_table}', $chunk_id) CONTENT $chunk;",
                chunk_table = Self::table_name(),
            ))
            .query(format!(
                "UPSERT type::thing('{emb_table}', $emb_id) CONTENT $emb;",
                emb_table = ChunkEmbedding::table_name(),
            ))
            .query("COMMIT TRANSACTION;")
            .bind(("chunk_id", chunk.id.clone()))
            .bind(("chunk", chunk))
            .bind(("emb_id", emb.id.clone()))
            .bind(("emb", emb))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Store a batch of chunks and embeddings in one transaction.
    pub async fn store_batch_with_embeddings(
        pairs: Vec<(Chunk, Vec<f32>)>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if pairs.is_empty() {
            return Ok(());
        }

        let mut chunks = Vec::with_capacity(pairs.len());
        let mut embeddings = Vec::with_capacity(pairs.len());
        for (chunk, vector) in pairs {
            embeddings.push(ChunkEmbedding::new(&chunk.id, chunk.corpus_id.clone(), vector));
            chunks.push(chunk);
        }

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "INSERT IGNORE INTO {} $chunks;",
                Self::table_name()
            ))
            .query(format!(
                "INSERT IGNORE INTO {} $embeddings;",
                ChunkEmbedding::table_name()
            ))
            .query("COMMIT TRANSACTION;")
            .bind(("chunks", chunks))
            .bind(("embeddings", embeddings))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Approximate nearest-neighbour search over the embedding table,
    /// hydrating the owning chunk rows.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<ChunkSearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: Chunk,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                chunk_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {emb_table}
            WHERE corpus_id = $corpus_id
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH chunk_id;
            "#,
            emb_table = ChunkEmbedding::table_name(),
            take = take
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|r| ChunkSearchResult {
                chunk: r.chunk_id,
                score: r.score,
            })
            .collect())
    }

    /// BM25 full-text search over chunk content.
    pub async fn fts_search(
        take: usize,
        terms: &str,
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<ChunkSearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            #[serde(deserialize_with = "deserialize_datetime")]
            created_at: DateTime<Utc>,
            #[serde(deserialize_with = "deserialize_datetime")]
            updated_at: DateTime<Utc>,
            corpus_id: String,
            file_path: String,
            start_line: u32,
            end_line: u32,
            language: Option<String>,
            content: String,
            token_count: u32,
            content_hash: String,
            summary: Option<String>,
            truncated: bool,
            score: f32,
        }

        let limit = i64::try_from(take).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            SELECT
                *,
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score
            FROM {chunk_table}
            WHERE content @0@ $terms
              AND corpus_id = $corpus_id
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            chunk_table = Self::table_name(),
        );

        let response = db
            .query(&sql)
            .bind(("terms", terms.to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("limit", limit))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let mut response = response.check().map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| ChunkSearchResult {
                chunk: Chunk {
                    id: r.id,
                    created_at: r.created_at,
                    updated_at: r.updated_at,
                    corpus_id: r.corpus_id,
                    file_path: r.file_path,
                    start_line: r.start_line,
                    end_line: r.end_line,
                    language: r.language,
                    content: r.content,
                    token_count: r.token_count,
                    content_hash: r.content_hash,
                    summary: r.summary,
                    truncated: r.truncated,
                },
                score: r.score,
            })
            .collect())
    }

    pub async fn get_by_ids(
        ids: Vec<String>,
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE id IN $things AND corpus_id = $corpus_id")
            .bind(("table", Self::table_name().to_owned()))
            .bind(("things", things))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }

    /// Chunks of one file whose line span contains `line`. Used to map graph
    /// entities back onto retrievable chunks.
    pub async fn find_by_location(
        db: &SurrealDbClient,
        corpus_id: &str,
        file_path: &str,
        line: u32,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .query(format!(
                "SELECT * FROM {} WHERE corpus_id = $corpus_id AND file_path = $file_path \
                 AND start_line <= $line AND end_line >= $line",
                Self::table_name()
            ))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("file_path", file_path.to_owned()))
            .bind(("line", i64::from(line)))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }

    /// Delete a file's chunks together with their embeddings.
    pub async fn delete_by_file(
        db: &SurrealDbClient,
        corpus_id: &str,
        file_path: &str,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 DELETE FROM chunk_embedding WHERE corpus_id = $corpus_id AND chunk_id IN \
                     (SELECT VALUE id FROM chunk WHERE corpus_id = $corpus_id AND file_path = $file_path);
                 DELETE FROM chunk WHERE corpus_id = $corpus_id AND file_path = $file_path;
                 COMMIT TRANSACTION;",
            )
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("file_path", file_path.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn delete_by_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 DELETE FROM chunk_embedding WHERE corpus_id = $corpus_id;
                 DELETE FROM chunk WHERE corpus_id = $corpus_id;
                 COMMIT TRANSACTION;",
            )
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn count_for_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            total: usize,
        }

        let mut response = db
            .query(format!(
                "SELECT count() AS total FROM {} WHERE corpus_id = $corpus_id GROUP ALL",
                Self::table_name()
            ))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;
        Ok(rows.first().map_or(0, |row| row.total))
    }
}
