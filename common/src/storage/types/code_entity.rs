use crate::storage::types::entity_embedding::CodeEntityEmbedding;
use crate::utils::ids;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Function,
    Class,
    Method,
    Module,
    Variable,
    /// Topical concept mined from comments/docstrings by the chat model.
    Concept,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Module => "module",
            Self::Variable => "variable",
            Self::Concept => "concept",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

stored_object!(CodeEntity, "code_entity", {
    corpus_id: String,
    name: String,
    qualified_name: String,
    kind: EntityKind,
    file_path: Option<String>,
    start_line: Option<u32>,
    end_line: Option<u32>,
    description: Option<String>,
    properties: Option<serde_json::Value>
});

/// Vector search result including hydrated entity.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CodeEntitySearchResult {
    pub entity: CodeEntity,
    pub score: f32,
}

impl CodeEntity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        corpus_id: String,
        name: String,
        qualified_name: String,
        kind: EntityKind,
        file_path: Option<String>,
        start_line: Option<u32>,
        end_line: Option<u32>,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let id = ids::entity_id(&corpus_id, &qualified_name, kind.as_str());
        Self {
            id,
            created_at: now,
            updated_at: now,
            corpus_id,
            name,
            qualified_name,
            kind,
            file_path,
            start_line,
            end_line,
            description,
            properties: None,
        }
    }

    /// BM25 search over entity names.
    pub async fn fts_search_by_name(
        take: usize,
        terms: &str,
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<CodeEntitySearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                id,
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score
            FROM {table}
            WHERE name @0@ $terms
              AND corpus_id = $corpus_id
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            table = Self::table_name(),
        );

        let response = db
            .query(&sql)
            .bind(("terms", terms.to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("limit", i64::try_from(take).unwrap_or(i64::MAX)))
            .await
            .map_err(AppError::Database)?;

        let mut response = response.check().map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
        let entities = Self::get_by_ids(ids, db, corpus_id).await?;
        let mut by_id: std::collections::HashMap<String, CodeEntity> = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(entity) = by_id.remove(&row.id) {
                results.push(CodeEntitySearchResult {
                    entity,
                    score: row.score,
                });
            }
        }
        Ok(results)
    }

    /// Cosine KNN over entity description embeddings.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<CodeEntitySearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            entity_id: CodeEntity,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                entity_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {emb_table}
            WHERE corpus_id = $corpus_id
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH entity_id;
            "#,
            emb_table = CodeEntityEmbedding::table_name(),
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
            .map(|r| CodeEntitySearchResult {
                entity: r.entity_id,
                score: r.score,
            })
            .collect())
    }

    pub async fn get_by_ids(
        ids: Vec<String>,
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<CodeEntity>, AppError> {
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

    pub async fn list_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<CodeEntity>, AppError> {
        let mut response = db
            .query(format!(
                "SELECT * FROM {} WHERE corpus_id = $corpus_id",
                Self::table_name()
            ))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }

    pub async fn list_ids_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
        }

        let mut response = db
            .query(format!(
                "SELECT id FROM {} WHERE corpus_id = $corpus_id",
                Self::table_name()
            ))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn delete_by_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 DELETE FROM code_entity_embedding WHERE corpus_id = $corpus_id;
                 DELETE FROM code_entity WHERE corpus_id = $corpus_id;
                 COMMIT TRANSACTION;",
            )
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Remove entities declared in a given file, together with their
    /// embeddings and any edges touching them; used by delta builds.
    pub async fn delete_by_file(
        db: &SurrealDbClient,
        corpus_id: &str,
        file_path: &str,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 LET $doomed = (SELECT VALUE id FROM code_entity WHERE corpus_id = $corpus_id AND file_path = $file_path);
                 DELETE FROM relates_to WHERE in IN $doomed OR out IN $doomed;
                 DELETE FROM code_entity_embedding WHERE corpus_id = $corpus_id AND entity_id IN $doomed;
                 DELETE FROM code_entity WHERE corpus_id = $corpus_id AND file_path = $file_path;
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
