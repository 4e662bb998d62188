//! Triplet mining from the usage event log.
//!
//! Explicit feedback dominates: a helpful mark is a positive, an unhelpful
//! mark a negative. With click data only, the highest-ranked clicked chunk is
//! the positive and a high-ranked chunk the user skipped past is sampled as
//! the negative, at lower confidence.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::Chunk},
    utils::config::LearningConfig,
};

use crate::events::UsageEvent;

/// Confidence attached to explicit positive/negative feedback pairs.
const CONFIDENCE_EXPLICIT: f32 = 1.0;
/// Explicit positive with a sampled negative.
const CONFIDENCE_SAMPLED_NEGATIVE: f32 = 0.8;
/// Click-through only.
const CONFIDENCE_CLICK: f32 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct Triplet {
    pub corpus_id: String,
    pub query: String,
    pub positive_chunk_id: String,
    pub negative_chunk_id: String,
    pub confidence: f32,
}

/// A triplet whose chunks were confirmed to still exist in the chunk store.
#[derive(Debug, Clone)]
pub struct ResolvedTriplet {
    pub corpus_id: String,
    pub query: String,
    pub positive: Chunk,
    pub negative: Chunk,
    pub confidence: f32,
}

#[derive(Default)]
struct QueryWindow {
    corpus_id: String,
    query: String,
    ranked: Vec<String>,
    positives: Vec<String>,
    negatives: Vec<String>,
    clicks: Vec<(usize, String)>,
}

/// Mine triplets from a window of the event log. Triplets below the
/// configured confidence floor are discarded here; existence of the chunks is
/// checked separately in [`resolve_triplets`].
pub fn mine_triplets(events: &[UsageEvent], config: &LearningConfig) -> Vec<Triplet> {
    let mut windows: BTreeMap<String, QueryWindow> = BTreeMap::new();

    for event in events {
        match event {
            UsageEvent::Query {
                query_id,
                corpus_id,
                query,
                ranked_chunk_ids,
                ..
            } => {
                let window = windows.entry(query_id.clone()).or_default();
                window.corpus_id = corpus_id.clone();
                window.query = query.clone();
                window.ranked = ranked_chunk_ids.clone();
            }
            UsageEvent::Feedback {
                query_id,
                chunk_id,
                helpful,
                ..
            } => {
                let window = windows.entry(query_id.clone()).or_default();
                if *helpful {
                    window.positives.push(chunk_id.clone());
                } else {
                    window.negatives.push(chunk_id.clone());
                }
            }
            UsageEvent::Click {
                query_id,
                chunk_id,
                rank,
                ..
            } => {
                let window = windows.entry(query_id.clone()).or_default();
                window.clicks.push((*rank, chunk_id.clone()));
            }
        }
    }

    let mut triplets = Vec::new();
    for window in windows.values() {
        // Feedback without a recorded query cannot be used.
        if window.query.is_empty() {
            continue;
        }
        if let Some(triplet) = mine_window(window, config) {
            if triplet.confidence >= config.min_confidence
                && triplet.positive_chunk_id != triplet.negative_chunk_id
            {
                triplets.push(triplet);
            }
        }
    }

    debug!(triplets = triplets.len(), "mined triplets from event window");
    triplets
}

fn mine_window(window: &QueryWindow, config: &LearningConfig) -> Option<Triplet> {
    let make = |positive: &str, negative: &str, confidence: f32| Triplet {
        corpus_id: window.corpus_id.clone(),
        query: window.query.clone(),
        positive_chunk_id: positive.to_owned(),
        negative_chunk_id: negative.to_owned(),
        confidence,
    };

    if let Some(positive) = window.positives.first() {
        if let Some(negative) = window.negatives.first() {
            return Some(make(positive, negative, CONFIDENCE_EXPLICIT));
        }
        let negative = sample_skipped(window, positive, config)?;
        return Some(make(positive, &negative, CONFIDENCE_SAMPLED_NEGATIVE));
    }

    // Click-through only: best-ranked click is the positive.
    let (_, clicked) = window.clicks.iter().min_by_key(|(rank, _)| *rank)?;
    let negative = sample_skipped(window, clicked, config)?;
    Some(make(clicked, &negative, CONFIDENCE_CLICK))
}

/// Highest-ranked chunk the user did not interact with, within the sampling
/// window.
fn sample_skipped(window: &QueryWindow, positive: &str, config: &LearningConfig) -> Option<String> {
    let interacted: HashSet<&str> = window
        .clicks
        .iter()
        .map(|(_, id)| id.as_str())
        .chain(window.positives.iter().map(String::as_str))
        .chain(std::iter::once(positive))
        .collect();

    window
        .ranked
        .iter()
        .take(config.negative_sample_rank.max(1))
        .find(|id| !interacted.contains(id.as_str()))
        .cloned()
}

/// Drop triplets whose chunks no longer exist (deleted corpora, rebuilt
/// files); training must only ever see live text.
pub async fn resolve_triplets(
    db: &SurrealDbClient,
    triplets: Vec<Triplet>,
) -> Result<Vec<ResolvedTriplet>, AppError> {
    let mut resolved = Vec::with_capacity(triplets.len());

    for triplet in triplets {
        let chunks = Chunk::get_by_ids(
            vec![
                triplet.positive_chunk_id.clone(),
                triplet.negative_chunk_id.clone(),
            ],
            db,
            &triplet.corpus_id,
        )
        .await?;

        let positive = chunks.iter().find(|c| c.id == triplet.positive_chunk_id);
        let negative = chunks.iter().find(|c| c.id == triplet.negative_chunk_id);
        match (positive, negative) {
            (Some(positive), Some(negative)) => resolved.push(ResolvedTriplet {
                corpus_id: triplet.corpus_id,
                query: triplet.query,
                positive: positive.clone(),
                negative: negative.clone(),
                confidence: triplet.confidence,
            }),
            _ => {
                debug!(
                    query = %triplet.query,
                    "discarding triplet with unresolvable chunks"
                );
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn query(query_id: &str, ranked: &[&str]) -> UsageEvent {
        UsageEvent::Query {
            query_id: query_id.to_owned(),
            corpus_id: "c1".to_owned(),
            query: "login handler".to_owned(),
            ranked_chunk_ids: ranked.iter().map(|s| (*s).to_owned()).collect(),
            at: Utc::now(),
        }
    }

    fn feedback(query_id: &str, chunk: &str, helpful: bool) -> UsageEvent {
        UsageEvent::Feedback {
            query_id: query_id.to_owned(),
            chunk_id: chunk.to_owned(),
            helpful,
            at: Utc::now(),
        }
    }

    fn click(query_id: &str, chunk: &str, rank: usize) -> UsageEvent {
        UsageEvent::Click {
            query_id: query_id.to_owned(),
            chunk_id: chunk.to_owned(),
            rank,
            at: Utc::now(),
        }
    }

    #[test]
    fn explicit_feedback_yields_full_confidence_triplet() {
        let events = vec![
            query("q1", &["a", "b", "c"]),
            feedback("q1", "a", true),
            feedback("q1", "c", false),
        ];
        let triplets = mine_triplets(&events, &LearningConfig::default());

        assert_eq!(triplets.len(), 1);
        assert_eq!(triplets[0].positive_chunk_id, "a");
        assert_eq!(triplets[0].negative_chunk_id, "c");
        assert!((triplets[0].confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn positive_without_negative_samples_a_skipped_chunk() {
        let events = vec![query("q1", &["a", "b", "c"]), feedback("q1", "b", true)];
        let triplets = mine_triplets(&events, &LearningConfig::default());

        assert_eq!(triplets.len(), 1);
        assert_eq!(triplets[0].positive_chunk_id, "b");
        assert_eq!(triplets[0].negative_chunk_id, "a", "highest-ranked skipped");
    }

    #[test]
    fn click_only_window_uses_best_click_as_positive() {
        let events = vec![
            query("q1", &["a", "b", "c"]),
            click("q1", "c", 3),
            click("q1", "b", 2),
        ];
        let triplets = mine_triplets(&events, &LearningConfig::default());

        assert_eq!(triplets.len(), 1);
        assert_eq!(triplets[0].positive_chunk_id, "b");
        assert_eq!(triplets[0].negative_chunk_id, "a");
        assert!(triplets[0].confidence < 1.0);
    }

    #[test]
    fn low_confidence_triplets_are_discarded() {
        let events = vec![query("q1", &["a", "b"]), click("q1", "b", 2)];
        let config = LearningConfig {
            min_confidence: 0.9,
            ..LearningConfig::default()
        };
        assert!(mine_triplets(&events, &config).is_empty());
    }

    #[test]
    fn window_without_query_event_is_ignored() {
        let events = vec![feedback("orphan", "a", true)];
        assert!(mine_triplets(&events, &LearningConfig::default()).is_empty());
    }

    #[test]
    fn no_interaction_yields_nothing() {
        let events = vec![query("q1", &["a", "b"])];
        assert!(mine_triplets(&events, &LearningConfig::default()).is_empty());
    }
}
