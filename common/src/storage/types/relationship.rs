use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::types::chunk::deserialize_flexible_id;
use crate::utils::ids;
use crate::{error::AppError, storage::db::SurrealDbClient};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Calls,
    Imports,
    Inherits,
    Contains,
    References,
    RelatedTo,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calls => "calls",
            Self::Imports => "imports",
            Self::Inherits => "inherits",
            Self::Contains => "contains",
            Self::References => "references",
            Self::RelatedTo => "related_to",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RelationshipMetadata {
    pub corpus_id: String,
    pub kind: RelationKind,
    pub weight: f32,
}

/// Directed typed edge between two code entities, stored in the `relates_to`
/// edge table. The id hashes `(source, target, kind)`, which both makes
/// re-relating idempotent and enforces the uniqueness of that tuple.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EntityRelationship {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
    pub in_: String,
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub out: String,
    pub metadata: RelationshipMetadata,
}

impl EntityRelationship {
    pub fn new(
        source_entity_id: String,
        target_entity_id: String,
        corpus_id: String,
        kind: RelationKind,
        weight: f32,
    ) -> Self {
        let id = ids::relationship_id(&source_entity_id, &target_entity_id, kind.as_str());
        Self {
            id,
            in_: source_entity_id,
            out: target_entity_id,
            metadata: RelationshipMetadata {
                corpus_id,
                kind,
                weight,
            },
        }
    }

    pub async fn store_relationship(&self, db_client: &SurrealDbClient) -> Result<(), AppError> {
        db_client
            .client
            .query(
                r#"BEGIN TRANSACTION;
                LET $in_entity = type::thing('code_entity', $in_id);
                LET $out_entity = type::thing('code_entity', $out_id);
                LET $relation = type::thing('relates_to', $rel_id);
                DELETE type::thing('relates_to', $rel_id);
                RELATE $in_entity->$relation->$out_entity SET
                    metadata.corpus_id = $corpus_id,
                    metadata.kind = $kind,
                    metadata.weight = $weight;
                COMMIT TRANSACTION;"#,
            )
            .bind(("rel_id", self.id.clone()))
            .bind(("in_id", self.in_.clone()))
            .bind(("out_id", self.out.clone()))
            .bind(("corpus_id", self.metadata.corpus_id.clone()))
            .bind(("kind", self.metadata.kind))
            .bind(("weight", self.metadata.weight))
            .await?
            .check()?;

        Ok(())
    }

    /// All edges touching the given entity, either direction.
    pub async fn edges_for_entity(
        db: &SurrealDbClient,
        corpus_id: &str,
        entity_id: &str,
    ) -> Result<Vec<EntityRelationship>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM relates_to
                 WHERE metadata.corpus_id = $corpus_id
                   AND (in = type::thing('code_entity', $entity_id)
                        OR out = type::thing('code_entity', $entity_id))",
            )
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("entity_id", entity_id.to_owned()))
            .await?;

        response.take(0).map_err(AppError::Database)
    }

    pub async fn list_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<EntityRelationship>, AppError> {
        let mut response = db
            .query("SELECT * FROM relates_to WHERE metadata.corpus_id = $corpus_id")
            .bind(("corpus_id", corpus_id.to_owned()))
            .await?;

        response.take(0).map_err(AppError::Database)
    }

    pub async fn delete_by_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<(), AppError> {
        db.client
            .query("DELETE FROM relates_to WHERE metadata.corpus_id = $corpus_id")
            .bind(("corpus_id", corpus_id.to_owned()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn count_for_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            total: usize,
        }

        let mut response = db
            .query("SELECT count() AS total FROM relates_to WHERE metadata.corpus_id = $corpus_id GROUP ALL")
            .bind(("corpus_id", corpus_id.to_owned()))
            .await?;

        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;
        Ok(rows.first().map_or(0, |row| row.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::code_entity::{CodeEntity, EntityKind};
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        SurrealDbClient::memory("rel_test_ns", &database)
            .await
            .expect("failed to start in-memory surrealdb")
    }

    fn entity(corpus: &str, name: &str) -> CodeEntity {
        CodeEntity::new(
            corpus.to_owned(),
            name.to_owned(),
            format!("m::{name}"),
            EntityKind::Function,
            Some("m.rs".to_owned()),
            Some(1),
            Some(10),
            None,
        )
    }

    #[tokio::test]
    async fn storing_same_edge_twice_keeps_one_row() {
        let db = setup_db().await;
        let a = entity("c1", "caller");
        let b = entity("c1", "callee");
        db.upsert_item(a.clone()).await.expect("store a");
        db.upsert_item(b.clone()).await.expect("store b");

        let rel = EntityRelationship::new(
            a.id.clone(),
            b.id.clone(),
            "c1".into(),
            RelationKind::Calls,
            1.0,
        );
        rel.store_relationship(&db).await.expect("first store");
        rel.store_relationship(&db).await.expect("second store");

        assert_eq!(
            EntityRelationship::count_for_corpus(&db, "c1")
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn edges_for_entity_sees_both_directions() {
        let db = setup_db().await;
        let a = entity("c1", "alpha");
        let b = entity("c1", "beta");
        let c = entity("c1", "gamma");
        for e in [a.clone(), b.clone(), c.clone()] {
            db.upsert_item(e).await.expect("store entity");
        }

        EntityRelationship::new(a.id.clone(), b.id.clone(), "c1".into(), RelationKind::Calls, 1.0)
            .store_relationship(&db)
            .await
            .expect("store a->b");
        EntityRelationship::new(
            c.id.clone(),
            a.id.clone(),
            "c1".into(),
            RelationKind::References,
            0.5,
        )
        .store_relationship(&db)
        .await
        .expect("store c->a");

        let edges = EntityRelationship::edges_for_entity(&db, "c1", &a.id)
            .await
            .expect("edges");

        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn same_endpoints_different_kind_are_distinct_edges() {
        let db = setup_db().await;
        let a = entity("c1", "one");
        let b = entity("c1", "two");
        db.upsert_item(a.clone()).await.expect("store a");
        db.upsert_item(b.clone()).await.expect("store b");

        EntityRelationship::new(a.id.clone(), b.id.clone(), "c1".into(), RelationKind::Calls, 1.0)
            .store_relationship(&db)
            .await
            .expect("store calls");
        EntityRelationship::new(
            a.id.clone(),
            b.id.clone(),
            "c1".into(),
            RelationKind::References,
            1.0,
        )
        .store_relationship(&db)
        .await
        .expect("store references");

        assert_eq!(
            EntityRelationship::count_for_corpus(&db, "c1")
                .await
                .expect("count"),
            2
        );
    }
}
