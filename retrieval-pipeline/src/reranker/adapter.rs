//! Learned adapter serving: a score-calibration head layered over the base
//! cross-encoder, hot-reloadable without disturbing in-flight scoring.
//!
//! The active adapter lives behind an `RwLock<Option<Arc<LoadedAdapter>>>`.
//! A scoring lease clones the `Arc`, so the reference count *is* the
//! in-flight reader count: a swap or unload replaces the pointer atomically
//! and the old weights are freed when the last lease drops. Cold loads are
//! single-flight behind a load mutex; a fingerprint watcher polls the weights
//! file and swaps when it changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::AppError;
use common::utils::{ids, tokens};

/// Calibration head over the base cross-encoder score. Trained by the
/// learning loop, promoted by an explicit operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterWeights {
    pub base_weight: f64,
    pub lexical_weight: f64,
    pub length_weight: f64,
    pub bias: f64,
}

impl Default for AdapterWeights {
    fn default() -> Self {
        Self {
            base_weight: 1.0,
            lexical_weight: 0.0,
            length_weight: 0.0,
            bias: 0.0,
        }
    }
}

/// Features the adapter scores over. Kept tiny on purpose: the base model
/// carries the semantics, the adapter only calibrates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankFeatures {
    pub base_score: f64,
    pub lexical_overlap: f64,
    pub length_norm: f64,
}

impl RerankFeatures {
    pub fn compute(query: &str, document: &str, base_score: f32) -> Self {
        let terms = tokens::keywords(query);
        Self {
            base_score: f64::from(base_score),
            lexical_overlap: f64::from(tokens::overlap_score(&terms, document)),
            length_norm: ((document.len() as f64).ln_1p() / 10.0).min(1.0),
        }
    }
}

impl AdapterWeights {
    pub fn raw(&self, features: &RerankFeatures) -> f64 {
        self.base_weight * features.base_score
            + self.lexical_weight * features.lexical_overlap
            + self.length_weight * features.length_norm
            + self.bias
    }

    pub fn score(&self, features: &RerankFeatures) -> f32 {
        sigmoid(self.raw(features)) as f32
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// One loaded adapter version. The version tag is monotonically increasing
/// per slot and exists so swap-safety is observable in tests and metadata.
#[derive(Debug)]
pub struct LoadedAdapter {
    pub weights: AdapterWeights,
    pub fingerprint: String,
    pub version: u64,
}

/// Serving slot for the active adapter.
pub struct AdapterSlot {
    weights_path: PathBuf,
    active: RwLock<Option<Arc<LoadedAdapter>>>,
    load_lock: tokio::sync::Mutex<()>,
    version_counter: AtomicU64,
    /// Milliseconds since `epoch` of the last lease, for idle unload.
    last_used_ms: AtomicU64,
    last_reload: RwLock<Option<Instant>>,
    epoch: Instant,
}

impl AdapterSlot {
    pub fn new(weights_path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            weights_path: weights_path.into(),
            active: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            version_counter: AtomicU64::new(0),
            last_used_ms: AtomicU64::new(0),
            last_reload: RwLock::new(None),
            epoch: Instant::now(),
        })
    }

    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_used_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_used_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    fn current(&self) -> Option<Arc<LoadedAdapter>> {
        self.active
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone))
    }

    /// Lease the active adapter for one scoring request, cold-loading it if
    /// necessary. Requests arriving during a cold load wait on the load lock
    /// rather than issuing a second load.
    pub async fn lease(&self) -> Result<Arc<LoadedAdapter>, AppError> {
        self.touch();
        if let Some(adapter) = self.current() {
            return Ok(adapter);
        }

        let _flight = self.load_lock.lock().await;
        // Another waiter may have finished the load while we queued.
        if let Some(adapter) = self.current() {
            return Ok(adapter);
        }

        let loaded = self.load_from_disk()?;
        info!(
            fingerprint = %loaded.fingerprint,
            version = loaded.version,
            "adapter cold-loaded"
        );
        self.install(Arc::clone(&loaded));
        Ok(loaded)
    }

    fn install(&self, adapter: Arc<LoadedAdapter>) {
        if let Ok(mut guard) = self.active.write() {
            *guard = Some(adapter);
        }
        if let Ok(mut guard) = self.last_reload.write() {
            *guard = Some(Instant::now());
        }
    }

    fn load_from_disk(&self) -> Result<Arc<LoadedAdapter>, AppError> {
        let bytes = fs::read(&self.weights_path).map_err(|err| {
            AppError::RerankerUnavailable(format!(
                "adapter weights at {}: {err}",
                self.weights_path.display()
            ))
        })?;
        let weights: AdapterWeights = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::RerankerUnavailable(format!("malformed adapter weights: {err}"))
        })?;
        let fingerprint = ids::sha256_hex(&bytes);
        let version = self.version_counter.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Arc::new(LoadedAdapter {
            weights,
            fingerprint,
            version,
        }))
    }

    pub fn fingerprint_on_disk(&self) -> Option<String> {
        fs::read(&self.weights_path).ok().map(|b| ids::sha256_hex(&b))
    }

    /// Swap in the on-disk weights when their fingerprint changed and the
    /// minimum reload interval has elapsed. The new adapter is fully loaded
    /// into a staging value before the pointer moves; in-flight leases keep
    /// the previous version until they drop.
    pub async fn maybe_reload(&self, min_interval: Duration) -> Result<bool, AppError> {
        let Some(active) = self.current() else {
            // Nothing served right now; the next lease cold-loads fresh.
            return Ok(false);
        };

        let recently_reloaded = self
            .last_reload
            .read()
            .ok()
            .and_then(|guard| *guard)
            .is_some_and(|at| at.elapsed() < min_interval);
        if recently_reloaded {
            return Ok(false);
        }

        let Some(on_disk) = self.fingerprint_on_disk() else {
            return Ok(false);
        };
        if on_disk == active.fingerprint {
            return Ok(false);
        }

        let _flight = self.load_lock.lock().await;
        let staged = self.load_from_disk()?;
        info!(
            old = %active.fingerprint,
            new = %staged.fingerprint,
            version = staged.version,
            "adapter hot-swapped"
        );
        self.install(staged);
        Ok(true)
    }

    /// Drop the active pointer after `unload_after` without leases. Memory is
    /// actually freed once the last in-flight lease drops its `Arc`.
    pub fn maybe_unload(&self, unload_after: Duration) -> bool {
        if self.current().is_none() || self.idle_for() < unload_after {
            return false;
        }
        if let Ok(mut guard) = self.active.write() {
            debug!("unloading idle adapter");
            *guard = None;
            return true;
        }
        false
    }

    /// Background watcher: polls the weights file every `reload_period` and
    /// applies hot reloads and idle unloads until cancelled.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        reload_period: Duration,
        min_reload_interval: Duration,
        unload_after: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let slot = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reload_period.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = slot.maybe_reload(min_reload_interval).await {
                            warn!(error = %err, "adapter reload failed; keeping active version");
                        }
                        slot.maybe_unload(unload_after);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_weights(path: &Path, base: f64) {
        let weights = AdapterWeights {
            base_weight: base,
            ..AdapterWeights::default()
        };
        fs::write(path, serde_json::to_vec(&weights).expect("serialize")).expect("write");
    }

    #[tokio::test]
    async fn cold_load_is_single_flight() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("weights.json");
        write_weights(&path, 1.0);
        let slot = AdapterSlot::new(&path);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let slot = Arc::clone(&slot);
            handles.push(tokio::spawn(async move { slot.lease().await }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            let adapter = handle.await.expect("join").expect("lease");
            versions.push(adapter.version);
        }
        versions.dedup();
        assert_eq!(versions, vec![1], "all leases must share one load");
    }

    #[tokio::test]
    async fn missing_weights_is_reranker_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let slot = AdapterSlot::new(dir.path().join("missing.json"));

        let err = slot.lease().await.expect_err("lease must fail");
        assert!(matches!(err, AppError::RerankerUnavailable(_)));
    }

    #[tokio::test]
    async fn reload_swaps_only_on_fingerprint_change() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("weights.json");
        write_weights(&path, 1.0);
        let slot = AdapterSlot::new(&path);

        let first = slot.lease().await.expect("lease");
        assert!(
            !slot.maybe_reload(Duration::ZERO).await.expect("reload"),
            "identical fingerprint must not swap"
        );

        write_weights(&path, 2.0);
        assert!(slot.maybe_reload(Duration::ZERO).await.expect("reload"));

        let second = slot.lease().await.expect("lease");
        assert_ne!(first.fingerprint, second.fingerprint);
        assert!(second.version > first.version);
    }

    #[tokio::test]
    async fn min_reload_interval_suppresses_rapid_swaps() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("weights.json");
        write_weights(&path, 1.0);
        let slot = AdapterSlot::new(&path);
        slot.lease().await.expect("lease");

        write_weights(&path, 2.0);
        let swapped = slot
            .maybe_reload(Duration::from_secs(3600))
            .await
            .expect("reload");
        assert!(!swapped, "interval gate must hold the old version");
    }

    #[tokio::test]
    async fn in_flight_leases_keep_their_version_across_a_swap() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("weights.json");
        write_weights(&path, 1.0);
        let slot = AdapterSlot::new(&path);

        // Half the queries lease before the swap, half after; each lease must
        // see exactly one version and versions must be monotonic.
        let mut before = Vec::new();
        for _ in 0..25 {
            before.push(slot.lease().await.expect("lease"));
        }

        write_weights(&path, 2.0);
        slot.maybe_reload(Duration::ZERO).await.expect("reload");

        let mut after = Vec::new();
        for _ in 0..25 {
            after.push(slot.lease().await.expect("lease"));
        }

        assert!(before.iter().all(|a| a.version == 1));
        assert!(after.iter().all(|a| a.version == 2));
        // The pre-swap leases still score with their original weights.
        let features = RerankFeatures {
            base_score: 1.0,
            lexical_overlap: 0.0,
            length_norm: 0.0,
        };
        for lease in &before {
            assert!((lease.weights.raw(&features) - 1.0).abs() < 1e-9);
        }
        for lease in &after {
            assert!((lease.weights.raw(&features) - 2.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn idle_unload_frees_the_slot_but_not_live_leases() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("weights.json");
        write_weights(&path, 1.0);
        let slot = AdapterSlot::new(&path);

        let held = slot.lease().await.expect("lease");
        assert!(
            slot.maybe_unload(Duration::ZERO),
            "idle slot should unload"
        );
        // The held lease still works against its own Arc.
        assert_eq!(held.version, 1);

        // Next lease cold-loads a fresh version.
        let next = slot.lease().await.expect("lease");
        assert_eq!(next.version, 2);
    }

    #[tokio::test]
    async fn unload_respects_recent_activity() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("weights.json");
        write_weights(&path, 1.0);
        let slot = AdapterSlot::new(&path);
        slot.lease().await.expect("lease");

        assert!(
            !slot.maybe_unload(Duration::from_secs(3600)),
            "recently used adapter must stay loaded"
        );
    }
}
