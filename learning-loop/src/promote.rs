//! Explicit adapter promotion.
//!
//! Training never touches the served adapter; an operator promotes a run, and
//! only when its primary metric beats the stored baseline by epsilon. The
//! swap is stage-and-rename, so the reranker's fingerprint watcher either
//! sees the old weights or the new ones, never a half-written file.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use common::{error::AppError, utils::ids};

use crate::trainer::RunManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub metric: f64,
    pub fingerprint: Option<String>,
    pub run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Baseline {
    fn default() -> Self {
        Self {
            metric: 0.0,
            fingerprint: None,
            run_id: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromoteOutcome {
    Promoted {
        run_id: String,
        fingerprint: String,
        metric: f64,
        previous_metric: f64,
    },
    Refused {
        candidate_metric: f64,
        baseline_metric: f64,
        epsilon: f64,
    },
}

/// Promote the adapter trained in `run_dir` into `adapter_dir` if and only if
/// its held-out metric exceeds the baseline by more than `epsilon`. A refusal
/// changes nothing on disk.
pub fn promote(
    run_dir: &Path,
    adapter_dir: &Path,
    epsilon: f64,
) -> Result<PromoteOutcome, AppError> {
    let manifest_bytes = fs::read(run_dir.join("adapter.json")).map_err(|err| {
        AppError::NotFound(format!("run manifest in {}: {err}", run_dir.display()))
    })?;
    let manifest: RunManifest = serde_json::from_slice(&manifest_bytes)?;

    let weights_bytes = fs::read(run_dir.join("weights.json")).map_err(|err| {
        AppError::NotFound(format!("run weights in {}: {err}", run_dir.display()))
    })?;
    let fingerprint = ids::sha256_hex(&weights_bytes);

    let baseline_path = adapter_dir.join("baseline.json");
    let baseline: Baseline = match fs::read(&baseline_path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Baseline::default(),
        Err(err) => return Err(AppError::Io(err)),
    };

    let candidate = manifest.metrics.holdout_mrr;
    if candidate <= baseline.metric + epsilon {
        info!(
            candidate,
            baseline = baseline.metric,
            epsilon,
            "promotion refused; candidate does not clear the gate"
        );
        return Ok(PromoteOutcome::Refused {
            candidate_metric: candidate,
            baseline_metric: baseline.metric,
            epsilon,
        });
    }

    fs::create_dir_all(adapter_dir)?;

    // Weights first: the watcher triggers off this file's fingerprint.
    stage_and_rename(&adapter_dir.join("weights.json"), &weights_bytes)?;
    stage_and_rename(&adapter_dir.join("adapter.json"), &manifest_bytes)?;

    let new_baseline = Baseline {
        metric: candidate,
        fingerprint: Some(fingerprint.clone()),
        run_id: Some(manifest.run_id.clone()),
        updated_at: Utc::now(),
    };
    stage_and_rename(&baseline_path, &serde_json::to_vec_pretty(&new_baseline)?)?;

    info!(
        run_id = %manifest.run_id,
        %fingerprint,
        metric = candidate,
        previous = baseline.metric,
        "adapter promoted"
    );
    Ok(PromoteOutcome::Promoted {
        run_id: manifest.run_id,
        fingerprint,
        metric: candidate,
        previous_metric: baseline.metric,
    })
}

fn stage_and_rename(target: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let staged = target.with_extension("json.tmp");
    fs::write(&staged, bytes)?;
    fs::rename(&staged, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::TrainMetrics;
    use retrieval_pipeline::reranker::adapter::AdapterWeights;
    use tempfile::TempDir;

    fn write_run(dir: &Path, run_id: &str, mrr: f64, base_weight: f64) {
        fs::create_dir_all(dir).expect("mkdir");
        let weights = AdapterWeights {
            base_weight,
            ..AdapterWeights::default()
        };
        fs::write(
            dir.join("weights.json"),
            serde_json::to_vec_pretty(&weights).expect("serialize"),
        )
        .expect("write weights");

        let manifest = RunManifest {
            run_id: run_id.to_owned(),
            created_at: Utc::now(),
            fingerprint: "unused-here".into(),
            metrics: TrainMetrics {
                triplets: 10,
                holdout_triplets: 2,
                train_loss: 0.4,
                holdout_mrr: mrr,
            },
        };
        fs::write(
            dir.join("adapter.json"),
            serde_json::to_vec_pretty(&manifest).expect("serialize"),
        )
        .expect("write manifest");
    }

    fn write_baseline(adapter_dir: &Path, metric: f64) {
        fs::create_dir_all(adapter_dir).expect("mkdir");
        let baseline = Baseline {
            metric,
            fingerprint: None,
            run_id: None,
            updated_at: Utc::now(),
        };
        fs::write(
            adapter_dir.join("baseline.json"),
            serde_json::to_vec_pretty(&baseline).expect("serialize"),
        )
        .expect("write baseline");
    }

    #[test]
    fn promotion_below_epsilon_is_refused_and_changes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let run_dir = dir.path().join("runs").join("run-1");
        let adapter_dir = dir.path().join("adapters").join("default");
        write_run(&run_dir, "run-1", 0.405, 2.0);
        write_baseline(&adapter_dir, 0.40);

        let outcome = promote(&run_dir, &adapter_dir, 0.01).expect("promote");

        assert!(matches!(outcome, PromoteOutcome::Refused { .. }));
        assert!(
            !adapter_dir.join("weights.json").exists(),
            "refusal must not install weights"
        );
    }

    #[test]
    fn promotion_above_epsilon_installs_atomically() {
        let dir = TempDir::new().expect("tempdir");
        let run_dir = dir.path().join("runs").join("run-2");
        let adapter_dir = dir.path().join("adapters").join("default");
        write_run(&run_dir, "run-2", 0.42, 3.0);
        write_baseline(&adapter_dir, 0.40);

        let outcome = promote(&run_dir, &adapter_dir, 0.01).expect("promote");

        let PromoteOutcome::Promoted { metric, previous_metric, .. } = outcome else {
            panic!("expected promotion");
        };
        assert!((metric - 0.42).abs() < 1e-9);
        assert!((previous_metric - 0.40).abs() < 1e-9);

        let weights: AdapterWeights = serde_json::from_slice(
            &fs::read(adapter_dir.join("weights.json")).expect("read weights"),
        )
        .expect("parse weights");
        assert!((weights.base_weight - 3.0).abs() < 1e-9);

        let baseline: Baseline = serde_json::from_slice(
            &fs::read(adapter_dir.join("baseline.json")).expect("read baseline"),
        )
        .expect("parse baseline");
        assert!((baseline.metric - 0.42).abs() < 1e-9);
        assert!(baseline.fingerprint.is_some());

        assert!(
            !adapter_dir.join("weights.json.tmp").exists(),
            "no staging residue after rename"
        );
    }

    #[test]
    fn first_promotion_with_no_baseline_uses_zero() {
        let dir = TempDir::new().expect("tempdir");
        let run_dir = dir.path().join("runs").join("run-3");
        let adapter_dir = dir.path().join("adapters").join("default");
        write_run(&run_dir, "run-3", 0.3, 1.5);

        let outcome = promote(&run_dir, &adapter_dir, 0.01).expect("promote");
        assert!(matches!(outcome, PromoteOutcome::Promoted { .. }));
    }

    #[test]
    fn promoted_weights_are_visible_to_the_reranker_watcher() {
        use retrieval_pipeline::reranker::adapter::AdapterSlot;

        let dir = TempDir::new().expect("tempdir");
        let run_dir = dir.path().join("runs").join("run-4");
        let adapter_dir = dir.path().join("adapters").join("default");
        write_run(&run_dir, "run-4", 0.5, 1.0);
        promote(&run_dir, &adapter_dir, 0.0).expect("first promote");

        let slot = AdapterSlot::new(adapter_dir.join("weights.json"));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let first = slot.lease().await.expect("lease");

            // A better run lands and is promoted; the watcher-side reload
            // sees the new fingerprint.
            let run_dir_2 = dir.path().join("runs").join("run-5");
            write_run(&run_dir_2, "run-5", 0.9, 4.0);
            promote(&run_dir_2, &adapter_dir, 0.01).expect("second promote");

            let swapped = slot
                .maybe_reload(std::time::Duration::ZERO)
                .await
                .expect("reload");
            assert!(swapped);

            let second = slot.lease().await.expect("lease");
            assert_ne!(first.fingerprint, second.fingerprint);
        });
    }
}
