//! Rank fusion across the three retrievers.
//!
//! RRF sums `w_i / (k + rank_i)` over the retrievers that returned a chunk;
//! the weighted variant min-max normalizes each list's scores first. Either
//! way, ties break on `(score desc, first seen rank, chunk_id)` so the fused
//! ordering is deterministic regardless of input arrival order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::json;

use common::utils::config::{FusionConfig, FusionMethod};

use crate::{ChunkMatch, MatchSource};

/// One retriever's contribution: its ranked list, or `None` when the
/// modality is disabled for this query. A demoted (failed/timed-out)
/// modality contributes `Some(vec![])`: enabled, but empty.
pub struct FusionInputs {
    pub vector: Option<Vec<ChunkMatch>>,
    pub sparse: Option<Vec<ChunkMatch>>,
    pub graph: Option<Vec<ChunkMatch>>,
}

struct Candidate {
    entry: ChunkMatch,
    fused: f32,
    first_seen_rank: usize,
    contributions: Vec<(MatchSource, usize, f32)>,
}

/// Fuse the ranked lists into one ordering, truncated to `final_k`.
pub fn fuse(inputs: FusionInputs, config: &FusionConfig) -> Vec<ChunkMatch> {
    let weights = normalized_weights(&inputs, config);

    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    let lists: [(MatchSource, &Option<Vec<ChunkMatch>>, f32); 3] = [
        (MatchSource::Vector, &inputs.vector, weights.0),
        (MatchSource::Sparse, &inputs.sparse, weights.1),
        (MatchSource::Graph, &inputs.graph, weights.2),
    ];

    for (source, list, weight) in lists {
        let Some(list) = list else { continue };
        let normalized = match config.method {
            FusionMethod::Rrf => Vec::new(),
            FusionMethod::Weighted => min_max_normalize(list),
        };

        for (i, item) in list.iter().enumerate() {
            let rank = i + 1;
            let term = match config.method {
                FusionMethod::Rrf => weight / (config.rrf_k + rank as f32),
                FusionMethod::Weighted => weight * normalized[i],
            };

            let candidate = candidates
                .entry(item.chunk_id.clone())
                .or_insert_with(|| Candidate {
                    entry: item.clone(),
                    fused: 0.0,
                    first_seen_rank: rank,
                    contributions: Vec::new(),
                });
            candidate.fused += term;
            candidate.first_seen_rank = candidate.first_seen_rank.min(rank);
            candidate.contributions.push((source, rank, item.score));
        }
    }

    let mut fused: Vec<Candidate> = candidates.into_values().collect();
    fused.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.first_seen_rank.cmp(&b.first_seen_rank))
            .then_with(|| a.entry.chunk_id.cmp(&b.entry.chunk_id))
    });
    fused.truncate(config.final_k);

    fused
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| {
            let contributions: Vec<serde_json::Value> = candidate
                .contributions
                .iter()
                .map(|(source, rank, score)| {
                    json!({ "source": source, "rank": rank, "score": score })
                })
                .collect();
            // Community matches keep their tag through fusion.
            let mut metadata = candidate.entry.metadata.clone();
            if let Some(object) = metadata.as_object_mut() {
                object.insert("fusion".into(), json!(contributions));
            }

            ChunkMatch {
                chunk_id: candidate.entry.chunk_id,
                score: candidate.fused,
                source: MatchSource::Fused,
                rank_within_source: i + 1,
                fused_score: Some(candidate.fused),
                chunk: candidate.entry.chunk,
                metadata,
            }
        })
        .collect()
}

/// Weights re-normalized so the *enabled* modalities sum to 1. A modality
/// demoted to empty still takes part (its weight simply finds no ranks).
fn normalized_weights(inputs: &FusionInputs, config: &FusionConfig) -> (f32, f32, f32) {
    let vector = inputs.vector.is_some().then_some(config.vector_weight);
    let sparse = inputs.sparse.is_some().then_some(config.sparse_weight);
    let graph = inputs.graph.is_some().then_some(config.graph_weight);

    let total: f32 = [vector, sparse, graph].iter().flatten().sum();
    if total <= f32::EPSILON {
        // Degenerate config; fall back to equal weights over enabled lists.
        let enabled = [vector, sparse, graph].iter().flatten().count().max(1);
        let each = 1.0 / enabled as f32;
        return (
            vector.map_or(0.0, |_| each),
            sparse.map_or(0.0, |_| each),
            graph.map_or(0.0, |_| each),
        );
    }

    (
        vector.unwrap_or(0.0) / total,
        sparse.unwrap_or(0.0) / total,
        graph.unwrap_or(0.0) / total,
    )
}

fn min_max_normalize(list: &[ChunkMatch]) -> Vec<f32> {
    if list.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for item in list {
        if !item.score.is_finite() {
            continue;
        }
        min = min.min(item.score);
        max = max.max(item.score);
    }
    if !min.is_finite() || !max.is_finite() {
        return vec![0.0; list.len()];
    }
    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; list.len()];
    }

    list.iter()
        .map(|item| {
            if item.score.is_finite() {
                ((item.score - min) / (max - min)).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::Chunk;
    use std::collections::HashSet;

    fn chunk(path: &str) -> Chunk {
        Chunk::new(
            "c1".into(),
            path.into(),
            1,
            20,
            Some("python".into()),
            format!("content of {path}"),
            5,
            false,
        )
    }

    fn entry(path: &str, source: MatchSource, rank: usize, score: f32) -> ChunkMatch {
        let chunk = chunk(path);
        ChunkMatch {
            chunk_id: chunk.id.clone(),
            score,
            source,
            rank_within_source: rank,
            fused_score: None,
            chunk,
            metadata: json!({}),
        }
    }

    fn config() -> FusionConfig {
        FusionConfig::default()
    }

    #[test]
    fn two_retrievers_agreeing_rank_first() {
        // Vector returns [a, b]; sparse returns [a]; graph returns nothing.
        let inputs = FusionInputs {
            vector: Some(vec![
                entry("a.py", MatchSource::Vector, 1, 0.91),
                entry("b.py", MatchSource::Vector, 2, 0.40),
            ]),
            sparse: Some(vec![entry("a.py", MatchSource::Sparse, 1, 3.2)]),
            graph: Some(Vec::new()),
        };

        let fused = fuse(inputs, &config());

        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].chunk.file_path, "a.py");
        assert_eq!(fused[1].chunk.file_path, "b.py");
        assert!(fused[0].score > fused[1].score);

        // a.py appears in two lists of three enabled, k = 60, equal weights.
        let expected = (1.0 / 3.0) * (1.0 / 61.0) + (1.0 / 3.0) * (1.0 / 61.0);
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn fused_set_is_subset_of_union() {
        let inputs = FusionInputs {
            vector: Some(vec![
                entry("a.py", MatchSource::Vector, 1, 0.9),
                entry("b.py", MatchSource::Vector, 2, 0.5),
            ]),
            sparse: Some(vec![
                entry("b.py", MatchSource::Sparse, 1, 2.0),
                entry("c.py", MatchSource::Sparse, 2, 1.0),
            ]),
            graph: Some(vec![entry("d.py", MatchSource::Graph, 1, 0.7)]),
        };

        let union: HashSet<String> = ["a.py", "b.py", "c.py", "d.py"]
            .iter()
            .map(|p| chunk(p).id)
            .collect();

        let fused = fuse(inputs, &config());
        for item in &fused {
            assert!(union.contains(&item.chunk_id));
        }
    }

    #[test]
    fn ordering_is_invariant_to_insertion_order() {
        let vector = vec![
            entry("a.py", MatchSource::Vector, 1, 0.9),
            entry("b.py", MatchSource::Vector, 2, 0.5),
        ];
        let sparse = vec![
            entry("c.py", MatchSource::Sparse, 1, 2.0),
            entry("a.py", MatchSource::Sparse, 2, 1.0),
        ];

        let first = fuse(
            FusionInputs {
                vector: Some(vector.clone()),
                sparse: Some(sparse.clone()),
                graph: None,
            },
            &config(),
        );
        // Same rankings presented through the other slots' iteration order.
        let second = fuse(
            FusionInputs {
                vector: Some(vector),
                sparse: Some(sparse),
                graph: Some(Vec::new()),
            },
            &config(),
        );

        let first_ids: Vec<&str> = first.iter().map(|m| m.chunk_id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|m| m.chunk_id.as_str()).collect();
        assert_eq!(first_ids, second_ids, "rankings must not depend on arrival order");
    }

    #[test]
    fn disabled_modality_is_excluded_from_weight_normalization() {
        let inputs_disabled = FusionInputs {
            vector: Some(vec![entry("a.py", MatchSource::Vector, 1, 0.9)]),
            sparse: None,
            graph: None,
        };
        let fused = fuse(inputs_disabled, &config());
        // Sole enabled modality carries full weight.
        let expected = 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn demoted_modality_keeps_its_weight_share() {
        let inputs = FusionInputs {
            vector: Some(vec![entry("a.py", MatchSource::Vector, 1, 0.9)]),
            sparse: Some(Vec::new()),
            graph: None,
        };
        let fused = fuse(inputs, &config());
        // Two enabled modalities; the empty one still halves the weight.
        let expected = 0.5 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn ties_break_deterministically_by_chunk_id() {
        let a = entry("x.py", MatchSource::Vector, 1, 0.9);
        let b = entry("y.py", MatchSource::Sparse, 1, 0.9);
        let expected_first = a.chunk_id.clone().min(b.chunk_id.clone());

        let fused = fuse(
            FusionInputs {
                vector: Some(vec![a]),
                sparse: Some(vec![b]),
                graph: None,
            },
            &config(),
        );

        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].chunk_id, expected_first);
    }

    #[test]
    fn weighted_method_min_max_normalizes_within_lists() {
        let mut cfg = config();
        cfg.method = FusionMethod::Weighted;

        let inputs = FusionInputs {
            vector: Some(vec![
                entry("a.py", MatchSource::Vector, 1, 0.9),
                entry("b.py", MatchSource::Vector, 2, 0.1),
            ]),
            sparse: Some(vec![
                entry("b.py", MatchSource::Sparse, 1, 10.0),
                entry("a.py", MatchSource::Sparse, 2, 9.9),
            ]),
            graph: None,
        };

        let fused = fuse(inputs, &cfg);
        // a: 0.5*1.0 + 0.5*0.0 = 0.5; b: 0.5*0.0 + 0.5*1.0 = 0.5, a tie, so
        // both normalize symmetrically and tie-breaks decide.
        assert_eq!(fused.len(), 2);
        assert!((fused[0].score - fused[1].score).abs() < 1e-6);
    }

    #[test]
    fn truncates_to_final_k() {
        let mut cfg = config();
        cfg.final_k = 2;

        let inputs = FusionInputs {
            vector: Some(vec![
                entry("a.py", MatchSource::Vector, 1, 0.9),
                entry("b.py", MatchSource::Vector, 2, 0.8),
                entry("c.py", MatchSource::Vector, 3, 0.7),
            ]),
            sparse: None,
            graph: None,
        };

        let fused = fuse(inputs, &cfg);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].rank_within_source, 1);
        assert_eq!(fused[1].rank_within_source, 2);
    }
}
