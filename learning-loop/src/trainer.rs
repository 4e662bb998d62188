//! Adapter training: pairwise logistic regression over the calibration
//! features, evaluated on a deterministic held-out split.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::{
    error::AppError,
    utils::{config::LearningConfig, ids, tokens},
};
use retrieval_pipeline::reranker::adapter::{sigmoid, AdapterWeights, RerankFeatures};
use retrieval_pipeline::reranker::RerankerPool;

use crate::miner::ResolvedTriplet;

/// Source of base cross-encoder scores during training. Production uses the
/// same local pool the learned reranker serves with; `LexicalOnly` keeps
/// training runnable without a model (tests, offline smoke).
pub enum BaseScorer {
    Pool(Arc<RerankerPool>),
    LexicalOnly,
}

impl BaseScorer {
    async fn score(&self, query: &str, document: &str) -> Result<f32, AppError> {
        match self {
            Self::Pool(pool) => {
                let lease = pool.checkout().await?;
                let scores = lease.score(query, vec![document.to_owned()]).await?;
                Ok(scores.first().copied().unwrap_or(0.0))
            }
            Self::LexicalOnly => {
                let terms = tokens::keywords(query);
                Ok(tokens::overlap_score(&terms, document))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrainMetrics {
    pub triplets: usize,
    pub holdout_triplets: usize,
    pub train_loss: f64,
    /// Primary metric; promotion gates on this.
    pub holdout_mrr: f64,
}

/// Written alongside the weights into the run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub metrics: TrainMetrics,
}

#[derive(Debug)]
pub struct TrainerOutput {
    pub weights: AdapterWeights,
    pub run_dir: PathBuf,
    pub metrics: TrainMetrics,
}

pub struct AdapterTrainer {
    config: LearningConfig,
    runs_dir: PathBuf,
}

struct Example {
    positive: RerankFeatures,
    negative: RerankFeatures,
    confidence: f64,
}

impl AdapterTrainer {
    pub fn new(data_dir: impl AsRef<Path>, config: LearningConfig) -> Self {
        Self {
            config,
            runs_dir: data_dir.as_ref().join("runs"),
        }
    }

    /// Train an adapter on the triplets and write `weights.json` plus a run
    /// manifest into `runs/<run_id>/`. Returns the held-out metrics the
    /// promote gate compares against the baseline.
    pub async fn train(
        &self,
        triplets: &[ResolvedTriplet],
        scorer: &BaseScorer,
        run_id: &str,
    ) -> Result<TrainerOutput, AppError> {
        if triplets.is_empty() {
            return Err(AppError::Validation(
                "cannot train an adapter on zero triplets".into(),
            ));
        }

        let mut train_set = Vec::new();
        let mut holdout = Vec::new();
        for triplet in triplets {
            let example = Example {
                positive: features(scorer, triplet, &triplet.positive.content).await?,
                negative: features(scorer, triplet, &triplet.negative.content).await?,
                confidence: f64::from(triplet.confidence),
            };
            if is_holdout(&triplet.query, self.config.holdout_fraction) {
                holdout.push(example);
            } else {
                train_set.push(example);
            }
        }
        // Tiny corpora can hash every query into one bucket; training still
        // needs both halves.
        if train_set.is_empty() {
            std::mem::swap(&mut train_set, &mut holdout);
        }

        let (weights, train_loss) = fit(&train_set, &self.config);
        let holdout_mrr = if holdout.is_empty() {
            mean_reciprocal_rank(&weights, &train_set)
        } else {
            mean_reciprocal_rank(&weights, &holdout)
        };

        let metrics = TrainMetrics {
            triplets: triplets.len(),
            holdout_triplets: holdout.len(),
            train_loss,
            holdout_mrr,
        };
        info!(
            run_id,
            triplets = metrics.triplets,
            holdout = metrics.holdout_triplets,
            mrr = metrics.holdout_mrr,
            "adapter training finished"
        );

        let run_dir = self.runs_dir.join(run_id);
        fs::create_dir_all(&run_dir)?;

        let weights_bytes = serde_json::to_vec_pretty(&weights)?;
        fs::write(run_dir.join("weights.json"), &weights_bytes)?;

        let manifest = RunManifest {
            run_id: run_id.to_owned(),
            created_at: Utc::now(),
            fingerprint: ids::sha256_hex(&weights_bytes),
            metrics,
        };
        fs::write(
            run_dir.join("adapter.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        Ok(TrainerOutput {
            weights,
            run_dir,
            metrics,
        })
    }
}

async fn features(
    scorer: &BaseScorer,
    triplet: &ResolvedTriplet,
    document: &str,
) -> Result<RerankFeatures, AppError> {
    let base = scorer.score(&triplet.query, document).await?;
    Ok(RerankFeatures::compute(&triplet.query, document, base))
}

/// Deterministic split: the same query always lands in the same bucket, so
/// repeated training runs evaluate on the same held-out set.
fn is_holdout(query: &str, fraction: f64) -> bool {
    let digest = ids::sha256_hex(query.as_bytes());
    let bucket = u64::from_str_radix(&digest[..8], 16).unwrap_or(0) % 1000;
    (bucket as f64) < fraction * 1000.0
}

/// Pairwise logistic fit: minimize `ln(1 + exp(-(s_pos - s_neg)))`, weighted
/// by triplet confidence.
fn fit(examples: &[Example], config: &LearningConfig) -> (AdapterWeights, f64) {
    let mut weights = AdapterWeights::default();
    let mut last_loss = f64::MAX;

    for epoch in 0..config.epochs.max(1) {
        let mut loss = 0.0;
        let mut grad = [0.0f64; 4];

        for example in examples {
            let margin = weights.raw(&example.positive) - weights.raw(&example.negative);
            loss += example.confidence * (1.0 + (-margin).exp()).ln();

            // d/dw ln(1+exp(-m)) = -sigmoid(-m) * dm/dw
            let coefficient = -example.confidence * sigmoid(-margin);
            let delta = feature_delta(&example.positive, &example.negative);
            for (slot, d) in grad.iter_mut().zip(delta) {
                *slot += coefficient * d;
            }
        }

        let n = examples.len().max(1) as f64;
        weights.base_weight -= config.learning_rate * grad[0] / n;
        weights.lexical_weight -= config.learning_rate * grad[1] / n;
        weights.length_weight -= config.learning_rate * grad[2] / n;
        weights.bias -= config.learning_rate * grad[3] / n;

        let loss = loss / n;
        if (last_loss - loss).abs() < 1e-9 {
            debug!(epoch, loss, "training converged early");
            last_loss = loss;
            break;
        }
        last_loss = loss;
    }

    (weights, last_loss)
}

fn feature_delta(positive: &RerankFeatures, negative: &RerankFeatures) -> [f64; 4] {
    [
        positive.base_score - negative.base_score,
        positive.lexical_overlap - negative.lexical_overlap,
        positive.length_norm - negative.length_norm,
        // Bias cancels in the pairwise margin but keeps the gradient shape.
        0.0,
    ]
}

/// Rank of the positive within its `(positive, negative)` pair, averaged as
/// a reciprocal rank: 1.0 when the positive wins, 0.5 when it loses.
fn mean_reciprocal_rank(weights: &AdapterWeights, examples: &[Example]) -> f64 {
    if examples.is_empty() {
        return 0.0;
    }
    let total: f64 = examples
        .iter()
        .map(|example| {
            if weights.raw(&example.positive) > weights.raw(&example.negative) {
                1.0
            } else {
                0.5
            }
        })
        .sum();
    total / examples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::Chunk;
    use tempfile::TempDir;

    fn chunk(path: &str, content: &str) -> Chunk {
        Chunk::new(
            "c1".into(),
            path.into(),
            1,
            10,
            Some("python".into()),
            content.into(),
            5,
            false,
        )
    }

    fn triplet(query: &str, positive_content: &str, negative_content: &str) -> ResolvedTriplet {
        ResolvedTriplet {
            corpus_id: "c1".into(),
            query: query.into(),
            positive: chunk("pos.py", positive_content),
            negative: chunk("neg.py", negative_content),
            confidence: 1.0,
        }
    }

    fn training_data() -> Vec<ResolvedTriplet> {
        vec![
            triplet("login session", "def login(): create session", "def unrelated(): pass"),
            triplet("parse tokens", "def parse(tokens): consume", "def draw(): render"),
            triplet("retry backoff", "def retry(): backoff sleep", "def css(): style"),
            triplet("hash digest", "def hash(data): digest", "def noop(): pass"),
            triplet("cache lookup", "def cache_lookup(key): hit", "def print_help(): usage"),
            triplet("socket bind", "def bind(socket): listen", "def color(): palette"),
        ]
    }

    #[tokio::test]
    async fn trained_adapter_separates_positives_from_negatives() {
        let dir = TempDir::new().expect("tempdir");
        let trainer = AdapterTrainer::new(dir.path(), LearningConfig::default());

        let output = trainer
            .train(&training_data(), &BaseScorer::LexicalOnly, "run-1")
            .await
            .expect("train");

        assert!(
            output.metrics.holdout_mrr > 0.5,
            "positives should usually outrank negatives, got {}",
            output.metrics.holdout_mrr
        );
        assert!(output.run_dir.join("weights.json").exists());
        assert!(output.run_dir.join("adapter.json").exists());
    }

    #[tokio::test]
    async fn training_is_deterministic() {
        let dir = TempDir::new().expect("tempdir");
        let trainer = AdapterTrainer::new(dir.path(), LearningConfig::default());

        let first = trainer
            .train(&training_data(), &BaseScorer::LexicalOnly, "run-a")
            .await
            .expect("train");
        let second = trainer
            .train(&training_data(), &BaseScorer::LexicalOnly, "run-b")
            .await
            .expect("train");

        assert_eq!(first.weights, second.weights);
        assert_eq!(first.metrics, second.metrics);
    }

    #[tokio::test]
    async fn zero_triplets_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let trainer = AdapterTrainer::new(dir.path(), LearningConfig::default());
        let err = trainer
            .train(&[], &BaseScorer::LexicalOnly, "run-empty")
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn holdout_split_is_stable() {
        for query in ["alpha", "beta", "gamma"] {
            assert_eq!(is_holdout(query, 0.2), is_holdout(query, 0.2));
        }
    }

    #[test]
    fn run_manifest_round_trips() {
        let manifest = RunManifest {
            run_id: "run-1".into(),
            created_at: Utc::now(),
            fingerprint: "abc".into(),
            metrics: TrainMetrics {
                triplets: 6,
                holdout_triplets: 1,
                train_loss: 0.5,
                holdout_mrr: 0.9,
            },
        };
        let raw = serde_json::to_string(&manifest).expect("serialize");
        let parsed: RunManifest = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed.metrics, manifest.metrics);
    }
}
