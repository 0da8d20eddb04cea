//! Per-client Stage-1 anomaly classifier.
//!
//! `examples/original_source/server/adrm/anomaly_model.py` wraps an sklearn
//! `IsolationForest` persisted via `joblib`: untrained, it always predicts
//! "not anomalous"; `load` on a missing or corrupt file silently falls back
//! to a fresh untrained model. No ML crate sits in this crate's dependency
//! stack, so the detector below reproduces that contract with a from-scratch
//! per-feature z-score classifier instead of porting a forest — trained on
//! the same five-feature vectors (`engine::featurize`), it flags a sample
//! anomalous when its squared z-score, summed across features, exceeds a
//! threshold equivalent to roughly three standard deviations per feature.

use serde::{Deserialize, Serialize};

const DEFAULT_SIGMA_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    trained: bool,
    feature_means: Vec<f64>,
    feature_stds: Vec<f64>,
}

impl Default for AnomalyModel {
    fn default() -> Self {
        Self {
            trained: false,
            feature_means: Vec::new(),
            feature_stds: Vec::new(),
        }
    }
}

impl AnomalyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Fits per-feature mean/std over `samples` (each a feature vector of
    /// identical length). Replaces any previous fit.
    pub fn train(&mut self, samples: &[Vec<f64>]) {
        if samples.is_empty() {
            return;
        }
        let dims = samples[0].len();
        let n = samples.len() as f64;
        let mut means = vec![0.0; dims];
        for sample in samples {
            for (i, v) in sample.iter().enumerate() {
                means[i] += v;
            }
        }
        for m in means.iter_mut() {
            *m /= n;
        }

        let mut variances = vec![0.0; dims];
        for sample in samples {
            for (i, v) in sample.iter().enumerate() {
                let d = v - means[i];
                variances[i] += d * d;
            }
        }
        let stds: Vec<f64> = variances
            .into_iter()
            .map(|v| (v / n).sqrt().max(1e-9))
            .collect();

        self.feature_means = means;
        self.feature_stds = stds;
        self.trained = true;
    }

    /// An untrained model always predicts "not anomalous" — mirrors the
    /// Python contract exactly (§4.6/4.7 rely on this during the warm-up
    /// buffering period before the first `train` call).
    pub fn predict(&self, features: &[f64]) -> bool {
        if !self.trained || features.len() != self.feature_means.len() {
            return false;
        }
        let sum_sq_z: f64 = features
            .iter()
            .zip(self.feature_means.iter())
            .zip(self.feature_stds.iter())
            .map(|((x, mean), std)| {
                let z = (x - mean) / std;
                z * z
            })
            .sum();
        let threshold = DEFAULT_SIGMA_THRESHOLD * DEFAULT_SIGMA_THRESHOLD * features.len() as f64;
        sum_sq_z > threshold
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("AnomalyModel serialization is infallible")
    }

    /// A missing or corrupt blob yields a fresh untrained model, matching the
    /// original's `load` fallback rather than propagating an error.
    pub fn from_json_or_default(contents: Option<&str>) -> Self {
        contents
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untrained_model_never_flags_anomalous() {
        let model = AnomalyModel::new();
        assert!(!model.predict(&[1000.0, 1000.0, 1000.0, 1000.0, 1000.0]));
    }

    #[test]
    fn trained_model_flags_large_outlier() {
        let mut model = AnomalyModel::new();
        let samples: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![1.0 + (i as f64) * 0.01, 0.1, 0.0, 2.0, 1.0])
            .collect();
        model.train(&samples);
        assert!(!model.predict(&[1.05, 0.1, 0.0, 2.0, 1.0]));
        assert!(model.predict(&[500.0, 0.1, 0.0, 2.0, 1.0]));
    }

    #[test]
    fn load_from_corrupt_json_yields_fresh_model() {
        let model = AnomalyModel::from_json_or_default(Some("not json"));
        assert!(!model.is_trained());
    }

    #[test]
    fn load_from_missing_file_yields_fresh_model() {
        let model = AnomalyModel::from_json_or_default(None);
        assert!(!model.is_trained());
    }
}
