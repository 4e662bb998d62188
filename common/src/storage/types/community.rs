use crate::utils::ids;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Community, "community", {
    corpus_id: String,
    /// Hierarchy level; 0 is the finest clustering.
    level: u32,
    member_ids: Vec<String>,
    summary: Option<String>
});

impl Community {
    pub fn new(corpus_id: String, level: u32, mut member_ids: Vec<String>) -> Self {
        let now = Utc::now();
        member_ids.sort();
        let id = ids::community_id(&corpus_id, level, &member_ids);
        Self {
            id,
            created_at: now,
            updated_at: now,
            corpus_id,
            level,
            member_ids,
            summary: None,
        }
    }

    /// Replace the corpus's communities with a freshly detected set.
    /// Communities are recomputed per build and never edited in place.
    pub async fn replace_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
        communities: Vec<Community>,
    ) -> Result<(), AppError> {
        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "DELETE FROM {} WHERE corpus_id = $corpus_id;",
                Self::table_name()
            ))
            .query(format!(
                "INSERT IGNORE INTO {} $communities;",
                Self::table_name()
            ))
            .query("COMMIT TRANSACTION;")
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("communities", communities))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<Community>, AppError> {
        let mut response = db
            .query(format!(
                "SELECT * FROM {} WHERE corpus_id = $corpus_id ORDER BY level, id",
                Self::table_name()
            ))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }

    pub async fn delete_by_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<(), AppError> {
        db.client
            .query(format!(
                "DELETE FROM {} WHERE corpus_id = $corpus_id",
                Self::table_name()
            ))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }
}
