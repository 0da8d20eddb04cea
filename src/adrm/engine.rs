//! C8: the two-stage ADRM engine, grounded in
//! `examples/original_source/server/adrm/adrm_engine.py`.
//!
//! Stage 1 runs per-update, as soon as a client's payload is decoded:
//! featurize, ask the champion classifier, reject-and-quarantine on a
//! positive, otherwise buffer the sample for challenger retraining. Stage 2
//! runs once per round over every accepted update, flagging peer outliers by
//! a median/MAD modified z-score — the median absolute deviation, unlike a
//! plain standard deviation, stays robust even when one of the few updates
//! in the group is itself the outlier being sought. A third, admin-triggered
//! operation evaluates champion and challenger against externally supplied
//! labeled data and promotes the challenger when it wins.

use std::collections::BTreeMap;

use crate::adrm::model_manager::ModelManager;
use crate::adrm::response::ResponseSystem;
use crate::types::ParameterMap;

/// Cross-client outlier detection requires at least this many updates in
/// the group; smaller groups have no meaningful "peer" baseline.
const MIN_UPDATES_FOR_CROSS_CLIENT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage1Outcome {
    Accepted,
    Anomalous,
}

/// Five summary statistics over a parameter map's flattened values: mean,
/// standard deviation, min, max, L2 norm. Matches the original's featurizer
/// exactly (it also restricts itself to numeric tensor values only).
pub fn featurize(map: &ParameterMap) -> Vec<f64> {
    let values = map.flatten();
    if values.is_empty() {
        return vec![0.0; 5];
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let l2_norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    vec![mean, std, min, max, l2_norm]
}

pub struct AdrmEngine {
    pub model_manager: ModelManager,
    pub response: ResponseSystem,
}

impl AdrmEngine {
    pub fn new(model_manager: ModelManager, response: ResponseSystem) -> Self {
        Self {
            model_manager,
            response,
        }
    }

    /// Stage 1: classifies a single decoded update. On `Anomalous` the
    /// caller is responsible for triggering the response system and
    /// quarantining the payload; nothing here mutates registry/blocklist
    /// state.
    pub fn process_update(
        &self,
        parameters: &ParameterMap,
        challenger_batch_size: usize,
    ) -> Result<Stage1Outcome, crate::error::PersistenceError> {
        let features = featurize(parameters);
        if self.model_manager.champion_predict(&features) {
            return Ok(Stage1Outcome::Anomalous);
        }
        self.model_manager
            .buffer_for_challenger(features, challenger_batch_size)?;
        Ok(Stage1Outcome::Accepted)
    }

    /// Spec §4.8 "evaluate and swap": given externally labeled rows (a
    /// feature vector plus a ground-truth anomalous/normal label per row),
    /// computes champion and challenger F1 against the anomalous-positive
    /// class, records both scores, and promotes the challenger when it
    /// clears `promotion_threshold`. `features` and `labels` must be the
    /// same length.
    pub fn evaluate_and_swap(
        &self,
        features: &[Vec<f64>],
        labels: &[bool],
        promotion_threshold: f64,
    ) -> Result<bool, crate::error::PersistenceError> {
        let champion_score = f1_score(features, labels, |f| self.model_manager.champion_predict(f));
        let challenger_score =
            f1_score(features, labels, |f| self.model_manager.challenger_predict(f));

        let promoted = self.model_manager.promote_if_better(
            champion_score,
            challenger_score,
            promotion_threshold,
        )?;
        self.model_manager
            .record_performance(champion_score, challenger_score, promoted)?;
        Ok(promoted)
    }

    /// Stage 2: flags peer outliers within one round's accepted updates by
    /// modified z-score over each client's update magnitude (L2 norm of its
    /// flattened values). Requires at least three updates; returns an empty
    /// set otherwise.
    pub fn detect_outliers_in_group(
        &self,
        updates: &BTreeMap<String, ParameterMap>,
        cross_client_threshold: f64,
    ) -> Vec<String> {
        if updates.len() < MIN_UPDATES_FOR_CROSS_CLIENT {
            return Vec::new();
        }

        let magnitudes: Vec<(String, f64)> = updates
            .iter()
            .map(|(client_id, params)| {
                let l2 = params.flatten().iter().map(|v| v * v).sum::<f64>().sqrt();
                (client_id.clone(), l2)
            })
            .collect();

        let mut sorted_mags: Vec<f64> = magnitudes.iter().map(|(_, m)| *m).collect();
        sorted_mags.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = median_of_sorted(&sorted_mags);

        let mut deviations: Vec<f64> = sorted_mags.iter().map(|m| (m - median).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mad = median_of_sorted(&deviations);

        if mad == 0.0 {
            return Vec::new();
        }

        magnitudes
            .into_iter()
            .filter_map(|(client_id, mag)| {
                let modified_z = 0.6745 * (mag - median) / mad;
                if modified_z.abs() > cross_client_threshold {
                    Some(client_id)
                } else {
                    None
                }
            })
            .collect()
    }
}

/// F1 of `predict` against `labels` over `features`, with "anomalous" (`true`)
/// as the positive class. Returns 0.0 when there are no true positives (no
/// predicted positives, no actual positives, or neither) — precision and
/// recall are each taken as 0 rather than undefined in that case.
fn f1_score(features: &[Vec<f64>], labels: &[bool], predict: impl Fn(&[f64]) -> bool) -> f64 {
    let mut tp = 0u32;
    let mut fp = 0u32;
    let mut fn_ = 0u32;
    for (row, &label) in features.iter().zip(labels.iter()) {
        match (predict(row), label) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    if tp == 0 {
        return 0.0;
    }
    let precision = tp as f64 / (tp + fp) as f64;
    let recall = tp as f64 / (tp + fn_) as f64;
    2.0 * precision * recall / (precision + recall)
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Tensor};

    fn map_with(values: &[f32]) -> ParameterMap {
        let mut map = ParameterMap::new();
        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        map.insert("w", Tensor::new(DType::F32, vec![values.len()], data));
        map
    }

    #[test]
    fn featurize_matches_summary_statistics() {
        let map = map_with(&[1.0, 2.0, 3.0]);
        let features = featurize(&map);
        assert_eq!(features.len(), 5);
        assert!((features[0] - 2.0).abs() < 1e-9);
        assert!((features[2] - 1.0).abs() < 1e-9);
        assert!((features[3] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn cross_client_outlier_is_flagged() {
        let mut updates = BTreeMap::new();
        updates.insert("a".to_string(), map_with(&[1.0, 1.0]));
        updates.insert("b".to_string(), map_with(&[1.1, 0.9]));
        updates.insert("c".to_string(), map_with(&[0.9, 1.1]));
        updates.insert("outlier".to_string(), map_with(&[500.0, 500.0]));

        let dir = tempfile::tempdir().unwrap();
        let engine = AdrmEngine::new(
            crate::adrm::model_manager::ModelManager::load(dir.path()),
            crate::adrm::response::ResponseSystem::load(dir.path()),
        );
        let outliers = engine.detect_outliers_in_group(&updates, 3.5);
        assert!(outliers.contains(&"outlier".to_string()));
        assert!(!outliers.contains(&"a".to_string()));
    }

    #[test]
    fn fewer_than_three_updates_yields_no_outliers() {
        let mut updates = BTreeMap::new();
        updates.insert("a".to_string(), map_with(&[1.0]));
        updates.insert("b".to_string(), map_with(&[500.0]));

        let dir = tempfile::tempdir().unwrap();
        let engine = AdrmEngine::new(
            crate::adrm::model_manager::ModelManager::load(dir.path()),
            crate::adrm::response::ResponseSystem::load(dir.path()),
        );
        assert!(engine.detect_outliers_in_group(&updates, 3.5).is_empty());
    }

    #[test]
    fn f1_score_is_perfect_for_exact_predictions() {
        let features = vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]];
        let labels = vec![true, false, true, false];
        let score = f1_score(&features, &labels, |row| row[0] == 1.0 || row[0] == 3.0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn f1_score_is_zero_with_no_true_positives() {
        let features = vec![vec![1.0], vec![2.0]];
        let labels = vec![true, false];
        let score = f1_score(&features, &labels, |_| false);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn evaluate_and_swap_promotes_better_challenger() {
        let dir = tempfile::tempdir().unwrap();
        let manager = crate::adrm::model_manager::ModelManager::load(dir.path());
        manager
            .buffer_for_challenger(vec![1.0, 0.0, 0.0, 1.0, 1.0], 2)
            .unwrap();
        manager
            .buffer_for_challenger(vec![1.1, 0.0, 0.0, 1.1, 1.1], 2)
            .unwrap();
        let engine = AdrmEngine::new(manager, crate::adrm::response::ResponseSystem::load(dir.path()));

        let features = vec![
            vec![1.0, 0.0, 0.0, 1.0, 1.0],
            vec![500.0, 0.0, 0.0, 500.0, 500.0],
        ];
        let labels = vec![false, true];

        let promoted = engine.evaluate_and_swap(&features, &labels, 0.5).unwrap();
        assert!(promoted);
    }
}
