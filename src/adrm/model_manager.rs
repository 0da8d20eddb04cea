//! C7: ADRM champion/challenger lifecycle, grounded in
//! `examples/original_source/server/adrm/model_manager.py`'s
//! `ADRMModelManager` (`promote_challenger_to_champion`, archived-on-promote
//! history, JSON performance log).
//!
//! The performance log is append-only JSONL (SPEC_FULL §10.7), not the
//! latest-pair snapshot the Python keeps — an auditable promotion history
//! fits this crate's "never overwrite an audit trail" persistence habit
//! better than mirroring the original's file shape exactly.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::adrm::anomaly_model::AnomalyModel;
use crate::error::PersistenceError;
use crate::persistence::{append_jsonl, write_json_atomic};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceLogEntry {
    pub ts: i64,
    pub champion_score: f64,
    pub challenger_score: f64,
    pub promoted: bool,
}

pub struct ModelManager {
    champion: Mutex<AnomalyModel>,
    challenger: Mutex<AnomalyModel>,
    challenger_buffer: Mutex<Vec<Vec<f64>>>,
    /// `database/adrm_models/` (spec §6): champion/challenger snapshots and
    /// promotion archives live here.
    dir: PathBuf,
    /// `database/adrm_performance_log.json` (spec §6) — sits at the database
    /// root, not under `dir`, despite being written one JSONL line at a time
    /// (SPEC_FULL §10.7's sanctioned append-only-history supplement).
    performance_log_path: PathBuf,
}

impl ModelManager {
    pub fn load(database_dir: &Path) -> Self {
        let dir = database_dir.join("adrm_models");
        let champion = AnomalyModel::from_json_or_default(
            std::fs::read_to_string(dir.join("champion.json")).ok().as_deref(),
        );
        let challenger = AnomalyModel::from_json_or_default(
            std::fs::read_to_string(dir.join("challenger.json")).ok().as_deref(),
        );
        Self {
            champion: Mutex::new(champion),
            challenger: Mutex::new(challenger),
            challenger_buffer: Mutex::new(Vec::new()),
            dir,
            performance_log_path: database_dir.join("adrm_performance_log.json"),
        }
    }

    pub fn champion_predict(&self, features: &[f64]) -> bool {
        self.champion.lock().predict(features)
    }

    pub fn challenger_predict(&self, features: &[f64]) -> bool {
        self.challenger.lock().predict(features)
    }

    fn persist_champion(&self) -> Result<(), PersistenceError> {
        let model = self.champion.lock();
        write_json_atomic(&self.dir.join("champion.json"), &*model)
    }

    fn persist_challenger(&self) -> Result<(), PersistenceError> {
        let model = self.challenger.lock();
        write_json_atomic(&self.dir.join("challenger.json"), &*model)
    }

    /// Buffers a normal-but-novel sample for challenger retraining; once the
    /// buffer reaches `batch_size`, retrains the challenger in place and
    /// clears the buffer.
    pub fn buffer_for_challenger(
        &self,
        features: Vec<f64>,
        batch_size: usize,
    ) -> Result<(), PersistenceError> {
        let mut buffer = self.challenger_buffer.lock();
        buffer.push(features);
        if buffer.len() >= batch_size {
            self.challenger.lock().train(&buffer);
            buffer.clear();
            drop(buffer);
            self.persist_challenger()?;
        }
        Ok(())
    }

    /// Spec §4.8 "evaluate and swap": appends one entry to the performance
    /// log, unconditionally. `promoted` reflects whatever `promote_if_better`
    /// decides in the same evaluation pass (the caller threads that value
    /// through — see `AdrmEngine::evaluate_and_swap`).
    pub fn record_performance(
        &self,
        champion_score: f64,
        challenger_score: f64,
        promoted: bool,
    ) -> Result<(), PersistenceError> {
        append_jsonl(
            &self.performance_log_path,
            &PerformanceLogEntry {
                ts: crate::util::now_unix(),
                champion_score,
                challenger_score,
                promoted,
            },
        )
    }

    /// Promotes the challenger to champion when `challenger_score >
    /// champion_score * promotion_threshold`: archives the outgoing champion
    /// under a timestamped file, the challenger becomes champion, and a
    /// fresh untrained challenger takes its place. Returns whether promotion
    /// happened.
    pub fn promote_if_better(
        &self,
        champion_score: f64,
        challenger_score: f64,
        promotion_threshold: f64,
    ) -> Result<bool, PersistenceError> {
        let promoted = challenger_score > champion_score * promotion_threshold;
        if !promoted {
            return Ok(false);
        }

        let archive_name = format!(
            "champion_archive_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        {
            let champion = self.champion.lock();
            write_json_atomic(&self.dir.join(archive_name), &*champion)?;
        }
        let new_champion = self.challenger.lock().clone();
        *self.champion.lock() = new_champion;
        *self.challenger.lock() = AnomalyModel::new();
        self.persist_champion()?;
        self.persist_challenger()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn buffering_to_batch_size_trains_challenger() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::load(dir.path());
        for i in 0..10 {
            manager
                .buffer_for_challenger(vec![1.0 + i as f64 * 0.01, 0.0, 0.0, 1.0, 1.0], 10)
                .unwrap();
        }
        assert!(manager.challenger.lock().is_trained());
    }

    #[test]
    fn promotion_swaps_champion_and_resets_challenger() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::load(dir.path());
        manager.challenger.lock().train(&[vec![1.0, 0.0, 0.0, 1.0, 1.0]]);
        let promoted = manager.promote_if_better(0.5, 1.0, 1.1).unwrap();
        manager.record_performance(0.5, 1.0, promoted).unwrap();
        assert!(promoted);
        assert!(manager.champion.lock().is_trained());
        assert!(!manager.challenger.lock().is_trained());
    }

    #[test]
    fn no_promotion_below_threshold() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::load(dir.path());
        let promoted = manager.promote_if_better(1.0, 1.05, 1.1).unwrap();
        assert!(!promoted);
    }

    #[test]
    fn on_disk_layout_matches_spec_paths() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::load(dir.path());
        manager.challenger.lock().train(&[vec![1.0, 0.0, 0.0, 1.0, 1.0]]);
        manager.promote_if_better(0.5, 1.0, 1.1).unwrap();
        manager.record_performance(0.5, 1.0, true).unwrap();

        assert!(dir.path().join("adrm_models").join("champion.json").exists());
        assert!(dir.path().join("adrm_models").join("challenger.json").exists());
        assert!(dir.path().join("adrm_performance_log.json").exists());
        assert!(!dir.path().join("adrm_models").join("performance_log.jsonl").exists());
    }
}
