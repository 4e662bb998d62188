use tracing::debug;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::config::{SparseSearchConfig, SparseTokenizer},
};

const FTS_ANALYZER_NAME: &str = "code_fts_analyzer";

#[derive(Clone, Copy)]
struct HnswIndexSpec {
    index_name: &'static str,
    table: &'static str,
}

const fn hnsw_index_specs() -> [HnswIndexSpec; 2] {
    [
        HnswIndexSpec {
            index_name: "idx_embedding_chunk_embedding",
            table: "chunk_embedding",
        },
        HnswIndexSpec {
            index_name: "idx_embedding_code_entity_embedding",
            table: "code_entity_embedding",
        },
    ]
}

#[derive(Clone, Copy)]
struct FtsIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const fn fts_index_specs() -> [FtsIndexSpec; 2] {
    [
        FtsIndexSpec {
            index_name: "chunk_fts_content_idx",
            table: "chunk",
            field: "content",
        },
        FtsIndexSpec {
            index_name: "code_entity_fts_name_idx",
            table: "code_entity",
            field: "name",
        },
    ]
}

fn analyzer_definition(tokenizer: SparseTokenizer) -> String {
    // The whitespace-preserving variant keeps identifiers intact; the stemmed
    // variant folds natural-language terms in comments and docs.
    let filters = match tokenizer {
        SparseTokenizer::Stemmed => "lowercase, ascii, snowball(english)",
        SparseTokenizer::Whitespace => "lowercase, ascii",
    };
    format!(
        "DEFINE ANALYZER OVERWRITE {FTS_ANALYZER_NAME} TOKENIZERS class, punct FILTERS {filters};"
    )
}

/// Define the FTS and HNSW indexes the retrievers depend on. Idempotent, and
/// overwrites existing definitions so dimension or analyzer changes during a
/// rebuild take effect.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
    sparse: &SparseSearchConfig,
) -> Result<(), AppError> {
    let analyzer_sql = analyzer_definition(sparse.tokenizer);
    db.client
        .query(analyzer_sql)
        .await
        .map_err(AppError::Database)?
        .check()
        .map_err(AppError::Database)?;

    // Sequential creation; concurrent DDL makes Surreal clash on read/write.
    for spec in fts_index_specs() {
        let sql = format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} FIELDS {field} \
             SEARCH ANALYZER {FTS_ANALYZER_NAME} BM25({k1},{b});",
            index = spec.index_name,
            table = spec.table,
            field = spec.field,
            k1 = sparse.k1,
            b = sparse.b,
        );
        debug!(index = spec.index_name, "defining FTS index");
        db.client
            .query(sql)
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
    }

    for spec in hnsw_index_specs() {
        let sql = format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} FIELDS embedding \
             HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;",
            index = spec.index_name,
            table = spec.table,
            dimension = embedding_dimension,
        );
        debug!(
            index = spec.index_name,
            dimension = embedding_dimension,
            "defining HNSW index"
        );
        db.client
            .query(sql)
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
    }

    Ok(())
}

/// Rebuild known indexes after bulk writes; skips any not yet defined.
pub async fn rebuild_indexes(db: &SurrealDbClient) -> Result<(), AppError> {
    for spec in fts_index_specs() {
        db.client
            .query(format!(
                "REBUILD INDEX IF EXISTS {} ON {};",
                spec.index_name, spec.table
            ))
            .await
            .map_err(AppError::Database)?;
    }
    for spec in hnsw_index_specs() {
        db.client
            .query(format!(
                "REBUILD INDEX IF EXISTS {} ON {};",
                spec.index_name, spec.table
            ))
            .await
            .map_err(AppError::Database)?;
    }
    Ok(())
}
