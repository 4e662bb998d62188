use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::Chunk,
            code_entity::CodeEntity,
            community::Community,
            relationship::EntityRelationship,
        },
    },
    utils::config::GraphSearchConfig,
};

use crate::{ChunkMatch, MatchSource};

/// Score decay applied per hop on top of edge strength.
const HOP_DECAY: f32 = 0.75;

#[derive(Debug, Clone)]
struct WalkedEntity {
    entity: CodeEntity,
    score: f32,
}

/// Graph-walk retrieval: seed entities by name and description matching, walk
/// typed edges up to `max_hops`, then map the reached entities back to chunks
/// through their declaration positions.
pub async fn retrieve(
    db: &SurrealDbClient,
    corpus_id: &str,
    query: &str,
    query_embedding: Option<Vec<f32>>,
    config: &GraphSearchConfig,
) -> Result<Vec<ChunkMatch>, AppError> {
    let seeds = seed_entities(db, corpus_id, query, query_embedding, config).await?;
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let walked = walk(db, corpus_id, seeds, config.max_hops).await?;

    // Best path weight per chunk.
    let mut chunk_scores: HashMap<String, (Chunk, f32)> = HashMap::new();
    for entry in walked.values() {
        let Some(file_path) = &entry.entity.file_path else {
            continue;
        };
        let Some(line) = entry.entity.start_line else {
            continue;
        };
        let chunks = Chunk::find_by_location(db, corpus_id, file_path, line).await?;
        for chunk in chunks {
            let slot = chunk_scores
                .entry(chunk.id.clone())
                .or_insert_with(|| (chunk.clone(), entry.score));
            slot.1 = slot.1.max(entry.score);
        }
    }

    let mut scored: Vec<(Chunk, f32)> = chunk_scores.into_values().collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    scored.truncate(config.topk_graph);

    let mut matches: Vec<ChunkMatch> = scored
        .into_iter()
        .enumerate()
        .map(|(i, (chunk, score))| ChunkMatch {
            chunk_id: chunk.id.clone(),
            score,
            source: MatchSource::Graph,
            rank_within_source: i + 1,
            fused_score: None,
            chunk,
            metadata: json!({ "path_weight": score }),
        })
        .collect();

    if config.include_communities {
        append_community_matches(db, corpus_id, &walked, &mut matches).await?;
    }

    debug!(corpus_id, results = matches.len(), "graph retrieval complete");
    Ok(matches)
}

/// Candidate seed set: entity-name FTS matches plus embedding matches against
/// entity descriptions, deduplicated keeping the best score.
async fn seed_entities(
    db: &SurrealDbClient,
    corpus_id: &str,
    query: &str,
    query_embedding: Option<Vec<f32>>,
    config: &GraphSearchConfig,
) -> Result<Vec<WalkedEntity>, AppError> {
    let take = config.topk_graph.max(4);

    let name_matches = CodeEntity::fts_search_by_name(take, query, db, corpus_id).await?;
    let description_matches = match query_embedding {
        Some(embedding) => CodeEntity::vector_search(take, embedding, db, corpus_id).await?,
        None => Vec::new(),
    };

    let mut seeds: HashMap<String, WalkedEntity> = HashMap::new();

    // FTS scores are unbounded; squash into (0, 1) before mixing with cosine.
    for row in name_matches {
        let score = row.score / (1.0 + row.score.abs());
        insert_best(&mut seeds, row.entity, score);
    }
    for row in description_matches {
        insert_best(&mut seeds, row.entity, row.score.clamp(0.0, 1.0));
    }

    Ok(seeds.into_values().collect())
}

fn insert_best(seeds: &mut HashMap<String, WalkedEntity>, entity: CodeEntity, score: f32) {
    let id = entity.id.clone();
    match seeds.get_mut(&id) {
        Some(existing) => existing.score = existing.score.max(score),
        None => {
            seeds.insert(id, WalkedEntity { entity, score });
        }
    }
}

/// Bounded best-path walk. An edge of weight `w` carries `w / (1 + w)` of its
/// source's score, further decayed per hop; revisits keep the best score.
async fn walk(
    db: &SurrealDbClient,
    corpus_id: &str,
    seeds: Vec<WalkedEntity>,
    max_hops: usize,
) -> Result<HashMap<String, WalkedEntity>, AppError> {
    let mut best: HashMap<String, WalkedEntity> = HashMap::new();
    let mut frontier: Vec<(String, f32)> = Vec::new();

    for seed in seeds {
        frontier.push((seed.entity.id.clone(), seed.score));
        best.insert(seed.entity.id.clone(), seed);
    }

    for _hop in 0..max_hops {
        let mut next_frontier: Vec<(String, f32)> = Vec::new();

        for (entity_id, score) in frontier {
            let edges = EntityRelationship::edges_for_entity(db, corpus_id, &entity_id).await?;
            for edge in edges {
                let neighbor_id = if edge.in_ == entity_id {
                    edge.out.clone()
                } else {
                    edge.in_.clone()
                };
                let strength = edge.metadata.weight / (1.0 + edge.metadata.weight);
                let neighbor_score = score * HOP_DECAY * strength;
                if neighbor_score <= f32::EPSILON {
                    continue;
                }

                let improved = best
                    .get(&neighbor_id)
                    .is_none_or(|known| neighbor_score > known.score);
                if !improved {
                    continue;
                }

                let entities =
                    CodeEntity::get_by_ids(vec![neighbor_id.clone()], db, corpus_id).await?;
                let Some(entity) = entities.into_iter().next() else {
                    continue;
                };
                best.insert(
                    neighbor_id.clone(),
                    WalkedEntity {
                        entity,
                        score: neighbor_score,
                    },
                );
                next_frontier.push((neighbor_id, neighbor_score));
            }
        }

        if next_frontier.is_empty() {
            break;
        }
        frontier = next_frontier;
    }

    Ok(best)
}

/// Community summaries ride along as virtual matches, tagged so downstream
/// stages treat them as non-code context rather than retrievable chunks.
async fn append_community_matches(
    db: &SurrealDbClient,
    corpus_id: &str,
    walked: &HashMap<String, WalkedEntity>,
    matches: &mut Vec<ChunkMatch>,
) -> Result<(), AppError> {
    let communities = Community::list_for_corpus(db, corpus_id).await?;
    let base_rank = matches.len();
    let mut added = 0usize;

    for community in communities {
        let Some(summary) = community.summary.clone() else {
            continue;
        };
        let overlap = community
            .member_ids
            .iter()
            .filter(|id| walked.contains_key(*id))
            .count();
        if overlap == 0 {
            continue;
        }
        let score = (overlap as f32) / (community.member_ids.len() as f32);

        let now = Utc::now();
        let virtual_chunk = Chunk {
            id: community.id.clone(),
            created_at: now,
            updated_at: now,
            corpus_id: corpus_id.to_owned(),
            file_path: String::new(),
            start_line: 0,
            end_line: 0,
            language: None,
            content: summary,
            token_count: 0,
            content_hash: String::new(),
            summary: None,
            truncated: false,
        };
        added += 1;
        matches.push(ChunkMatch {
            chunk_id: community.id.clone(),
            score,
            source: MatchSource::Graph,
            rank_within_source: base_rank + added,
            fused_score: None,
            chunk: virtual_chunk,
            metadata: json!({ "community": true, "level": community.level }),
        });
    }

    Ok(())
}
