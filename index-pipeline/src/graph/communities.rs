//! Community detection over the entity graph.
//!
//! Deterministic label propagation: every entity starts in its own community
//! and repeatedly adopts the label carrying the most edge weight among its
//! neighbors, with ties broken towards the smallest label. Iteration order is
//! sorted, so the same graph always clusters the same way.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use common::{
    storage::types::{community::Community, relationship::EntityRelationship},
    utils::chat::ChatModel,
};

const MAX_ROUNDS: usize = 10;
const SUMMARY_SYSTEM_PROMPT: &str = "You summarize clusters of code entities. \
Given entity names from one cluster, describe in one sentence what the cluster \
is about. Respond with the sentence only.";

pub fn detect_communities(
    corpus_id: &str,
    entity_ids: &[String],
    relationships: &[EntityRelationship],
) -> Vec<Community> {
    let mut labels: BTreeMap<String, String> = entity_ids
        .iter()
        .map(|id| (id.clone(), id.clone()))
        .collect();

    let mut adjacency: BTreeMap<String, Vec<(String, f32)>> = BTreeMap::new();
    for edge in relationships {
        if !labels.contains_key(&edge.in_) || !labels.contains_key(&edge.out) {
            continue;
        }
        let weight = edge.metadata.weight.max(f32::EPSILON);
        adjacency
            .entry(edge.in_.clone())
            .or_default()
            .push((edge.out.clone(), weight));
        adjacency
            .entry(edge.out.clone())
            .or_default()
            .push((edge.in_.clone(), weight));
    }

    let node_order: Vec<String> = labels.keys().cloned().collect();
    for round in 0..MAX_ROUNDS {
        let mut changed = false;
        for node in &node_order {
            let Some(neighbors) = adjacency.get(node) else {
                continue;
            };
            let mut tally: BTreeMap<&str, f32> = BTreeMap::new();
            for (neighbor, weight) in neighbors {
                if let Some(label) = labels.get(neighbor) {
                    *tally.entry(label.as_str()).or_default() += weight;
                }
            }
            // Max weight, ties to the smallest label; BTreeMap iteration is
            // ascending, so strictly-greater comparisons keep the smallest.
            let mut best: Option<(&str, f32)> = None;
            for (label, weight) in tally {
                if best.is_none_or(|(_, best_weight)| weight > best_weight) {
                    best = Some((label, weight));
                }
            }
            if let Some((label, _)) = best {
                let label = label.to_owned();
                if labels.get(node).is_some_and(|current| *current != label) {
                    labels.insert(node.clone(), label);
                    changed = true;
                }
            }
        }
        if !changed {
            debug!(round, "label propagation converged");
            break;
        }
    }

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (node, label) in labels {
        groups.entry(label).or_default().push(node);
    }

    groups
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|members| Community::new(corpus_id.to_owned(), 0, members))
        .collect()
}

/// Generate one-sentence summaries from member names only; the chat model
/// never sees source code here.
pub async fn summarize_communities(
    chat: &ChatModel,
    communities: &mut [Community],
    names_by_id: &BTreeMap<String, String>,
) {
    for community in communities.iter_mut() {
        let member_names: Vec<&str> = community
            .member_ids
            .iter()
            .filter_map(|id| names_by_id.get(id).map(String::as_str))
            .collect();
        if member_names.is_empty() {
            continue;
        }
        let user = format!("Entity names: {}", member_names.join(", "));
        match chat.generate(SUMMARY_SYSTEM_PROMPT, &user).await {
            Ok(summary) => community.summary = Some(summary.trim().to_owned()),
            Err(err) => {
                warn!(error = %err, "community summary generation failed; leaving empty");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::relationship::RelationKind;

    fn edge(a: &str, b: &str, weight: f32) -> EntityRelationship {
        EntityRelationship::new(
            a.to_owned(),
            b.to_owned(),
            "c1".to_owned(),
            RelationKind::Calls,
            weight,
        )
    }

    #[test]
    fn connected_entities_cluster_together() {
        let ids: Vec<String> = ["a", "b", "c", "x", "y"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let edges = vec![edge("a", "b", 1.0), edge("b", "c", 1.0), edge("x", "y", 1.0)];

        let communities = detect_communities("c1", &ids, &edges);

        assert_eq!(communities.len(), 2);
        let sizes: Vec<usize> = communities.iter().map(|c| c.member_ids.len()).collect();
        assert!(sizes.contains(&3));
        assert!(sizes.contains(&2));
    }

    #[test]
    fn detection_is_deterministic() {
        let ids: Vec<String> = ["n1", "n2", "n3", "n4"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let edges = vec![edge("n1", "n2", 1.0), edge("n2", "n3", 2.0), edge("n3", "n4", 1.0)];

        let first = detect_communities("c1", &ids, &edges);
        let second = detect_communities("c1", &ids, &edges);

        let first_ids: Vec<&str> = first.iter().map(|c| c.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn isolated_entities_form_no_community() {
        let ids: Vec<String> = ["lone"].iter().map(|s| (*s).to_owned()).collect();
        let communities = detect_communities("c1", &ids, &[]);
        assert!(communities.is_empty());
    }
}
