//! C11: global model registry, the sole owner of `GlobalModel` (spec §4.11).
//! Evaluation is delegated to an externally supplied callback — per spec §9,
//! the model/evaluation surface is kept to a narrow capability set so this
//! crate compiles and tests without embedding an ML runtime.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::persistence::{write_atomic, write_json_atomic};
use crate::types::{GlobalModel, MetricRecord, ParameterMap};

/// Held-out evaluation, supplied by the embedding application. The core
/// itself never interprets tensor values as a model.
pub trait Evaluator: Send + Sync {
    /// Returns `(accuracy, loss)` for the given parameters.
    fn evaluate(&self, parameters: &ParameterMap) -> (f64, f64);
}

struct AggregationWindow {
    first_round: u64,
    first_ts: i64,
    last_round: u64,
    last_ts: i64,
}

pub struct GlobalModelRegistry {
    model: Mutex<GlobalModel>,
    metrics: Mutex<Vec<MetricRecord>>,
    aggregation_window: Mutex<Option<AggregationWindow>>,
    saved_models_dir: PathBuf,
    metrics_path: PathBuf,
    convergence_window: u64,
}

impl GlobalModelRegistry {
    pub fn new(
        initial: ParameterMap,
        saved_models_dir: &Path,
        database_dir: &Path,
        convergence_window: u64,
        now: i64,
    ) -> Self {
        let metrics_path = database_dir.join("logs").join("model_metrics_history.json");
        let metrics = std::fs::read_to_string(&metrics_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            model: Mutex::new(GlobalModel::new(initial, now)),
            metrics: Mutex::new(metrics),
            aggregation_window: Mutex::new(None),
            saved_models_dir: saved_models_dir.to_path_buf(),
            metrics_path,
            convergence_window,
        }
    }

    pub fn state(&self) -> ParameterMap {
        self.model.lock().parameters.clone()
    }

    pub fn version(&self) -> u64 {
        self.model.lock().version
    }

    /// Swaps in `new_params` and bumps `version`.
    pub fn apply(&self, new_params: ParameterMap) {
        let mut model = self.model.lock();
        model.parameters = new_params;
        model.version += 1;
    }

    /// Runs `evaluator` against the current parameters. On strict accuracy
    /// improvement, persists the parameters under a versioned filename and
    /// resets `rounds_since_last_improvement`; otherwise increments it.
    pub fn evaluate(
        &self,
        evaluator: &dyn Evaluator,
        now: i64,
    ) -> Result<(f64, f64), PersistenceError> {
        let (accuracy, loss, improved, version, parameters) = {
            let mut model = self.model.lock();
            let (accuracy, loss) = evaluator.evaluate(&model.parameters);
            model.last_evaluated_at = Some(now);
            let improved = accuracy > model.best_accuracy_so_far;
            if improved {
                model.best_accuracy_so_far = accuracy;
                model.rounds_since_last_improvement = 0;
            } else {
                model.rounds_since_last_improvement += 1;
            }
            (accuracy, loss, improved, model.version, model.parameters.clone())
        };

        if improved {
            let pct = (accuracy * 100.0).round() as i64;
            let filename = format!("best_model_v{version}_acc{pct}.pt");
            write_atomic(
                &self.saved_models_dir.join(filename),
                &crate::codec::tensor::encode(&parameters),
            )?;
        }
        Ok((accuracy, loss))
    }

    pub fn has_converged(&self) -> bool {
        self.model.lock().rounds_since_last_improvement >= self.convergence_window
    }

    /// Tracks the first and most recent aggregation event's round/timestamp,
    /// for admin-surface reporting.
    pub fn record_aggregation_event(&self, round: u64, now: i64) {
        let mut window = self.aggregation_window.lock();
        match window.as_mut() {
            Some(w) => {
                w.last_round = round;
                w.last_ts = now;
            }
            None => {
                *window = Some(AggregationWindow {
                    first_round: round,
                    first_ts: now,
                    last_round: round,
                    last_ts: now,
                });
            }
        }
    }

    pub fn first_and_last_aggregation(&self) -> Option<(u64, i64, u64, i64)> {
        self.aggregation_window
            .lock()
            .as_ref()
            .map(|w| (w.first_round, w.first_ts, w.last_round, w.last_ts))
    }

    pub fn add_metrics(
        &self,
        round: u64,
        metrics: std::collections::BTreeMap<String, f64>,
        method: &str,
        now: i64,
    ) -> Result<(), PersistenceError> {
        let mut history = self.metrics.lock();
        history.push(MetricRecord {
            round,
            timestamp: now,
            aggregation_method: method.to_string(),
            metrics,
        });
        write_json_atomic(&self.metrics_path, &*history)
    }

    pub fn metrics_history(&self) -> Vec<MetricRecord> {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Tensor};
    use tempfile::tempdir;

    struct FixedEvaluator(f64, f64);
    impl Evaluator for FixedEvaluator {
        fn evaluate(&self, _parameters: &ParameterMap) -> (f64, f64) {
            (self.0, self.1)
        }
    }

    fn sample_params() -> ParameterMap {
        let mut m = ParameterMap::new();
        m.insert("w", Tensor::new(DType::F32, vec![1], vec![0u8; 4]));
        m
    }

    #[test]
    fn apply_bumps_version() {
        let dir = tempdir().unwrap();
        let registry = GlobalModelRegistry::new(sample_params(), dir.path(), dir.path(), 10, 0);
        assert_eq!(registry.version(), 0);
        registry.apply(sample_params());
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn evaluate_tracks_best_accuracy_and_resets_counter() {
        let dir = tempdir().unwrap();
        let registry = GlobalModelRegistry::new(sample_params(), dir.path(), dir.path(), 3, 0);
        registry.evaluate(&FixedEvaluator(0.5, 0.1), 1).unwrap();
        registry.evaluate(&FixedEvaluator(0.4, 0.2), 2).unwrap();
        registry.evaluate(&FixedEvaluator(0.4, 0.2), 3).unwrap();
        assert!(registry.has_converged());
        registry.evaluate(&FixedEvaluator(0.9, 0.05), 4).unwrap();
        assert!(!registry.has_converged());
    }

    #[test]
    fn add_metrics_persists_history() {
        let dir = tempdir().unwrap();
        let registry = GlobalModelRegistry::new(sample_params(), dir.path(), dir.path(), 10, 0);
        let mut metrics = std::collections::BTreeMap::new();
        metrics.insert("accuracy".to_string(), 0.8);
        registry.add_metrics(1, metrics, "fedadam", 100).unwrap();
        assert_eq!(registry.metrics_history().len(), 1);
    }
}
