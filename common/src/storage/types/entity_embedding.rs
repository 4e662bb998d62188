use surrealdb::RecordId;

use crate::storage::types::code_entity::CodeEntity;
use crate::stored_object;

stored_object!(CodeEntityEmbedding, "code_entity_embedding", {
    /// Record link to the owning code_entity
    entity_id: RecordId,
    /// Denormalized corpus id for scoped search and bulk deletes
    corpus_id: String,
    /// Embedding of the entity description
    embedding: Vec<f32>
});

impl CodeEntityEmbedding {
    /// `entity_key` is the **key** part of the code_entity id.
    pub fn new(entity_key: &str, corpus_id: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();

        Self {
            id: entity_key.to_owned(),
            created_at: now,
            updated_at: now,
            entity_id: RecordId::from_table_key(CodeEntity::table_name(), entity_key),
            corpus_id,
            embedding,
        }
    }
}
