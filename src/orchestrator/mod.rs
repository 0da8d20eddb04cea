//! C12: round orchestrator. The single state machine spec §4.12 describes,
//! grounded in the teacher's `commands/run.rs` periodic-ticker design
//! (`tokio::select!` over `tokio::time::interval`s driving a consensus tick)
//! generalized from block-minting to round selection/collection/aggregation.
//!
//! All state transitions are serialized by one lock (`Inner`, guarded by
//! `parking_lot::Mutex` — the same synchronous-lock convention the registry
//! and response system use, since nothing under the lock ever performs
//! network I/O). `tick()` is the only entry point that *initiates* a new
//! round or a timeout; `receive_update`/`receive_share` only append to the
//! in-flight round's buffers and may trigger aggregation themselves once
//! quorum is reached, matching the concurrency contract in spec §5.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::adrm::engine::{AdrmEngine, Stage1Outcome};
use crate::codec::{he, tensor};
use crate::error::{DecodeError, PrivacyDecodeError, ReconstructError, StructureMismatch};
use crate::model_registry::GlobalModelRegistry;
use crate::ppm::PrivacyPolicyAuditor;
use crate::registry::ClientRegistry;
use crate::sam::{all_same_privacy_mode, AggregationMethod, SecureAggregationDispatcher};
use crate::types::{BlockSeverity, OrchestratorState, ParameterMap, PrivacyMode, RoundState};

pub struct OrchestratorConfig {
    pub clients_per_round: usize,
    pub min_clients_for_round: usize,
    pub round_timeout_seconds: u64,
    pub max_rounds: u64,
    pub aggregation_method: AggregationMethod,
    pub sss_k: u32,
    /// ADRM's adjustable knobs, shared with the admin REST surface so
    /// `PUT /api/admin/adrm/config` takes effect on the next evaluation
    /// without restarting the process (SPEC_FULL §10.7).
    pub tuning: Arc<AdrmTuning>,
}

/// Live-adjustable ADRM thresholds. Each field is its own lock so one
/// update doesn't block unrelated reads.
pub struct AdrmTuning {
    pub block_duration_minutes: Mutex<u64>,
    pub promotion_threshold: Mutex<f64>,
    pub challenger_batch_size: Mutex<usize>,
    pub cross_client_threshold: Mutex<f64>,
    pub reputation_penalty_for_block: Mutex<i32>,
    pub reputation_penalty_low: Mutex<i32>,
}

impl AdrmTuning {
    pub fn new(
        block_duration_minutes: u64,
        promotion_threshold: f64,
        challenger_batch_size: usize,
        cross_client_threshold: f64,
        reputation_penalty_for_block: i32,
        reputation_penalty_low: i32,
    ) -> Self {
        Self {
            block_duration_minutes: Mutex::new(block_duration_minutes),
            promotion_threshold: Mutex::new(promotion_threshold),
            challenger_batch_size: Mutex::new(challenger_batch_size),
            cross_client_threshold: Mutex::new(cross_client_threshold),
            reputation_penalty_for_block: Mutex::new(reputation_penalty_for_block),
            reputation_penalty_low: Mutex::new(reputation_penalty_low),
        }
    }

    /// Partial update: a `None` field leaves the current value untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_patch(
        &self,
        block_duration_minutes: Option<u64>,
        promotion_threshold: Option<f64>,
        challenger_batch_size: Option<usize>,
        cross_client_threshold: Option<f64>,
        reputation_penalty_for_block: Option<i32>,
        reputation_penalty_low: Option<i32>,
    ) {
        if let Some(v) = block_duration_minutes {
            *self.block_duration_minutes.lock() = v;
        }
        if let Some(v) = promotion_threshold {
            *self.promotion_threshold.lock() = v;
        }
        if let Some(v) = challenger_batch_size {
            *self.challenger_batch_size.lock() = v;
        }
        if let Some(v) = cross_client_threshold {
            *self.cross_client_threshold.lock() = v;
        }
        if let Some(v) = reputation_penalty_for_block {
            *self.reputation_penalty_for_block.lock() = v;
        }
        if let Some(v) = reputation_penalty_low {
            *self.reputation_penalty_low.lock() = v;
        }
    }

    pub fn snapshot(&self) -> (u64, f64, usize, f64, i32, i32) {
        (
            *self.block_duration_minutes.lock(),
            *self.promotion_threshold.lock(),
            *self.challenger_batch_size.lock(),
            *self.cross_client_threshold.lock(),
            *self.reputation_penalty_for_block.lock(),
            *self.reputation_penalty_low.lock(),
        )
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("client is currently blocked")]
    Blocked,
    #[error("no round is currently collecting updates")]
    WrongState,
    #[error("client was not selected for the current round")]
    NotSelected,
    #[error("SSS-mode updates must be submitted via submit_share")]
    WrongMode,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    PrivacyDecode(#[from] PrivacyDecodeError),
    #[error(transparent)]
    StructureMismatch(#[from] StructureMismatch),
    #[error("update rejected by the anomaly detector")]
    Anomalous,
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("client is currently blocked")]
    Blocked,
    #[error("no round is currently collecting updates")]
    WrongState,
    #[error("client was not selected for the current round")]
    NotSelected,
    #[error("share_index {index} is out of range for total_shares {total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),
    #[error("reconstructed update was rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("client is currently blocked")]
    Blocked,
    #[error("no round is currently serving the model to clients")]
    WrongState,
    #[error("client was not selected for the current round")]
    NotSelected,
}

struct Inner {
    round: RoundState,
    rounds_completed: u64,
}

/// Owns `RoundState` exclusively (spec §3 ownership summary). Every other
/// component it touches (`ClientRegistry`, `ResponseSystem`, `AdrmEngine`,
/// `PrivacyPolicyAuditor`, `SecureAggregationDispatcher`,
/// `GlobalModelRegistry`) is handed in by reference at construction time —
/// the cyclic response-system/registry relationship the source has is
/// avoided entirely because the orchestrator is the only caller of both.
pub struct RoundOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<ClientRegistry>,
    adrm: Arc<AdrmEngine>,
    ppm: Arc<PrivacyPolicyAuditor>,
    sam: Arc<SecureAggregationDispatcher>,
    model: Arc<GlobalModelRegistry>,
    evaluator: Arc<dyn crate::model_registry::Evaluator>,
    inner: Mutex<Inner>,
}

impl RoundOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<ClientRegistry>,
        adrm: Arc<AdrmEngine>,
        ppm: Arc<PrivacyPolicyAuditor>,
        sam: Arc<SecureAggregationDispatcher>,
        model: Arc<GlobalModelRegistry>,
        evaluator: Arc<dyn crate::model_registry::Evaluator>,
        now: i64,
    ) -> Self {
        Self {
            config,
            registry,
            adrm,
            ppm,
            sam,
            model,
            evaluator,
            inner: Mutex::new(Inner {
                round: RoundState::new(0, now),
                rounds_completed: 0,
            }),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.lock().round.state
    }

    pub fn round_number(&self) -> u64 {
        self.inner.lock().round.round_number
    }

    pub fn rounds_completed(&self) -> u64 {
        self.inner.lock().rounds_completed
    }

    pub fn selected_clients(&self) -> Vec<String> {
        self.inner.lock().round.selected_clients.iter().cloned().collect()
    }

    pub fn updates_received(&self) -> usize {
        self.inner.lock().round.updates.len()
    }

    /// One-shot read: true only the first time it is observed after a
    /// client is selected, so the control channel can piggyback "new round
    /// available" on the client's next heartbeat without duplicating.
    pub fn consume_new_round_flag(&self, client_id: &str) -> bool {
        match self.registry.get(client_id) {
            Some(record) if record.pending_round_notice => {
                let _ = self.registry.clear_pending_round_notice(client_id);
                true
            }
            _ => false,
        }
    }

    /// The single periodic entry point (spec §5): drives every state
    /// transition that isn't triggered directly by an arriving update.
    pub fn tick(&self, now: i64) {
        let mut inner = self.inner.lock();
        match inner.round.state {
            OrchestratorState::Idle | OrchestratorState::PausedInsufficientClients => {
                self.try_start_round(&mut inner, now);
            }
            OrchestratorState::WaitingForUpdates => {
                self.check_quorum_or_timeout(&mut inner, now);
            }
            OrchestratorState::ClientSelection
            | OrchestratorState::Aggregating
            | OrchestratorState::Finished
            | OrchestratorState::Standby => {}
        }
    }

    pub fn stop_training(&self) {
        self.inner.lock().round.state = OrchestratorState::Standby;
    }

    fn try_start_round(&self, inner: &mut Inner, now: i64) {
        let is_blocked = |cid: &str| self.adrm.response.is_blocked(cid, now);
        let eligible = self.registry.eligible_count(is_blocked);
        if eligible < self.config.clients_per_round {
            inner.round.state = OrchestratorState::PausedInsufficientClients;
            return;
        }

        let round_number = inner.round.round_number + 1;
        let selected = self
            .registry
            .select_for_round(self.config.clients_per_round, is_blocked);
        inner.round = RoundState::new(round_number, now);

        if selected.is_empty() {
            inner.round.state = OrchestratorState::PausedInsufficientClients;
            return;
        }

        for client_id in &selected {
            inner.round.selected_clients.insert(client_id.clone());
            let _ = self.registry.mark_selected(client_id, round_number);
        }
        inner.round.state = OrchestratorState::WaitingForUpdates;
    }

    fn check_quorum_or_timeout(&self, inner: &mut Inner, now: i64) {
        let selected_count = inner.round.selected_clients.len();
        let received = inner.round.updates.len();

        if received >= selected_count || received >= self.config.min_clients_for_round {
            self.aggregate_locked(inner, now);
            return;
        }

        let elapsed = now - inner.round.round_start_ts;
        if elapsed > self.config.round_timeout_seconds as i64 {
            if received >= self.config.min_clients_for_round {
                self.aggregate_locked(inner, now);
            } else {
                self.reset_round_to_idle(inner, now);
            }
        }
    }

    /// Spec §4.12 aggregation step: stage-2 peer check, homogeneity check,
    /// PPM consult, SAM dispatch, apply + evaluate + record, clear round.
    /// Assumes the caller already holds `inner`'s lock; runs fully under it.
    fn aggregate_locked(&self, inner: &mut Inner, now: i64) {
        inner.round.state = OrchestratorState::Aggregating;
        let round_number = inner.round.round_number;
        let mut updates = std::mem::take(&mut inner.round.updates);

        let plain: BTreeMap<String, ParameterMap> = updates
            .iter()
            .map(|(cid, (params, _mode))| (cid.clone(), params.clone()))
            .collect();
        let (block_duration_minutes, _promotion_threshold, _challenger_batch_size, cross_client_threshold, reputation_penalty_for_block, reputation_penalty_low) =
            self.config.tuning.snapshot();
        let outliers = self
            .adrm
            .detect_outliers_in_group(&plain, cross_client_threshold);
        for client_id in &outliers {
            if let Some((params, _mode)) = updates.remove(client_id) {
                let bytes = tensor::encode(&params);
                let _ = self
                    .adrm
                    .response
                    .quarantine_update(round_number, client_id, &bytes);
                let _ = self.adrm.response.trigger_response(
                    &self.registry,
                    client_id,
                    BlockSeverity::High,
                    "peer-outlier",
                    "flagged by stage-2 cross-client magnitude check",
                    reputation_penalty_for_block,
                    reputation_penalty_low,
                    block_duration_minutes,
                    now,
                );
            }
        }

        if updates.is_empty() {
            self.reset_round_to_idle(inner, now);
            return;
        }

        let modes: Vec<PrivacyMode> = updates.values().map(|(_, mode)| *mode).collect();
        if !all_same_privacy_mode(modes.iter().copied()) {
            self.reset_round_to_idle(inner, now);
            return;
        }
        let common_mode = modes[0];
        if !self.ppm.verify_audit(common_mode) {
            self.reset_round_to_idle(inner, now);
            return;
        }

        let method = if common_mode == PrivacyMode::He {
            AggregationMethod::HomomorphicAggregation
        } else {
            self.config.aggregation_method
        };

        let global_params = self.model.state();
        let deltas: Vec<ParameterMap> = updates.values().map(|(p, _)| p.clone()).collect();

        match self.sam.aggregate(&deltas, &global_params, method) {
            Ok(new_params) => {
                self.model.apply(new_params);
                let (accuracy, loss) = self
                    .model
                    .evaluate(self.evaluator.as_ref(), now)
                    .unwrap_or((0.0, 0.0));
                self.model.record_aggregation_event(round_number, now);

                let mut metrics = BTreeMap::new();
                metrics.insert("accuracy".to_string(), accuracy);
                metrics.insert("loss".to_string(), loss);
                let _ = self
                    .model
                    .add_metrics(round_number, metrics, method.name(), now);

                for client_id in updates.keys() {
                    let _ = self
                        .registry
                        .record_round_participation(client_id, round_number, true);
                }

                inner.rounds_completed += 1;
                inner.round.round_end_ts = Some(now);
                inner.round.selected_clients.clear();
                inner.round.shares.clear();
                inner.round.share_totals.clear();
                inner.round.state = if inner.rounds_completed >= self.config.max_rounds {
                    OrchestratorState::Finished
                } else {
                    OrchestratorState::Idle
                };
            }
            Err(_aggregation_error) => {
                self.reset_round_to_idle(inner, now);
            }
        }
    }

    fn reset_round_to_idle(&self, inner: &mut Inner, now: i64) {
        inner.round.updates.clear();
        inner.round.shares.clear();
        inner.round.share_totals.clear();
        inner.round.selected_clients.clear();
        inner.round.round_end_ts = Some(now);
        inner.round.state = OrchestratorState::Idle;
    }

    /// Runs the conformance check and stage-1 classifier on a decoded
    /// update, triggering the response system on either failure mode, then
    /// buffers it. Shared by the Normal/HE/SSS receive paths.
    fn accept_decoded_update(
        &self,
        inner: &mut Inner,
        client_id: &str,
        params: ParameterMap,
        mode: PrivacyMode,
        now: i64,
    ) -> Result<(), SubmitError> {
        let (block_duration_minutes, _promotion_threshold, challenger_batch_size, _cross_client_threshold, reputation_penalty_for_block, reputation_penalty_low) =
            self.config.tuning.snapshot();

        let global = self.model.state();
        if let Err(mismatch) = params.check_conformant(&global) {
            let _ = self.adrm.response.trigger_response(
                &self.registry,
                client_id,
                BlockSeverity::High,
                "structure-mismatch",
                &mismatch.0,
                reputation_penalty_for_block,
                reputation_penalty_low,
                block_duration_minutes,
                now,
            );
            return Err(SubmitError::StructureMismatch(mismatch));
        }

        match self.adrm.process_update(&params, challenger_batch_size) {
            Ok(Stage1Outcome::Accepted) => {}
            Ok(Stage1Outcome::Anomalous) => {
                let round_number = inner.round.round_number;
                let bytes = tensor::encode(&params);
                let _ = self
                    .adrm
                    .response
                    .quarantine_update(round_number, client_id, &bytes);
                let _ = self.adrm.response.trigger_response(
                    &self.registry,
                    client_id,
                    BlockSeverity::High,
                    "stage1-anomaly",
                    "flagged by per-update champion classifier",
                    reputation_penalty_for_block,
                    reputation_penalty_low,
                    block_duration_minutes,
                    now,
                );
                return Err(SubmitError::Anomalous);
            }
            Err(_persistence_error) => {
                // challenger buffer write failed; non-fatal per spec §7.
            }
        }

        inner.round.updates.insert(client_id.to_string(), (params, mode));
        Ok(())
    }

    /// Exposes the shared blocklist/quarantine component so the transport
    /// layer can report block state (e.g. on the admin surface) without
    /// keeping a second, divergent `ResponseSystem` instance of its own.
    pub fn response(&self) -> &crate::adrm::response::ResponseSystem {
        &self.adrm.response
    }

    /// Dispatches a `Normal`/`HE` update per spec §4.12. `SSS` updates must
    /// arrive via `receive_share` instead.
    pub fn receive_update(
        &self,
        client_id: &str,
        privacy_mode: PrivacyMode,
        payload: &[u8],
        now: i64,
    ) -> Result<(), SubmitError> {
        if self.adrm.response.is_blocked(client_id, now) {
            return Err(SubmitError::Blocked);
        }

        let mut inner = self.inner.lock();
        if inner.round.state != OrchestratorState::WaitingForUpdates {
            return Err(SubmitError::WrongState);
        }
        if !inner.round.selected_clients.contains(client_id) {
            return Err(SubmitError::NotSelected);
        }

        let params = match privacy_mode {
            PrivacyMode::Normal => tensor::decode(payload)?,
            PrivacyMode::He => he::decrypt(payload)?,
            PrivacyMode::Sss => return Err(SubmitError::WrongMode),
        };

        let result = self.accept_decoded_update(&mut inner, client_id, params, privacy_mode, now);
        if result.is_ok() {
            self.maybe_trigger_quorum(&mut inner, now);
        }
        result
    }

    /// Handles one SSS share bundle. Reconstructs once `k` bundles for this
    /// client have arrived; any further shares for an already-reconstructed
    /// client are silently discarded (spec §3/§8).
    pub fn receive_share(
        &self,
        client_id: &str,
        share_index: u32,
        total_shares: u32,
        data: Vec<u8>,
        now: i64,
    ) -> Result<(), ShareError> {
        if self.adrm.response.is_blocked(client_id, now) {
            return Err(ShareError::Blocked);
        }

        let mut inner = self.inner.lock();
        if inner.round.state != OrchestratorState::WaitingForUpdates {
            return Err(ShareError::WrongState);
        }
        if !inner.round.selected_clients.contains(client_id) {
            return Err(ShareError::NotSelected);
        }
        if share_index >= total_shares {
            return Err(ShareError::IndexOutOfRange {
                index: share_index,
                total: total_shares,
            });
        }
        if inner.round.updates.contains_key(client_id) {
            // Reconstruction already happened for this client; drop silently.
            return Ok(());
        }

        inner
            .round
            .share_totals
            .entry(client_id.to_string())
            .or_insert(total_shares);
        let bundle_map = inner.round.shares.entry(client_id.to_string()).or_default();
        bundle_map.insert(share_index, data);

        let k = self.config.sss_k as usize;
        if bundle_map.len() < k {
            return Ok(());
        }

        let bundles: Vec<crate::codec::sss::ShareBundle> = bundle_map
            .values()
            .filter_map(|bytes| bincode::deserialize(bytes).ok())
            .collect();
        inner.round.shares.remove(client_id);
        inner.round.share_totals.remove(client_id);

        let params = crate::codec::sss::reconstruct(&bundles)?;
        let result = self.accept_decoded_update(&mut inner, client_id, params, PrivacyMode::Sss, now);
        match result {
            Ok(()) => {
                self.maybe_trigger_quorum(&mut inner, now);
                Ok(())
            }
            Err(submit_error) => Err(ShareError::Rejected(submit_error.to_string())),
        }
    }

    fn maybe_trigger_quorum(&self, inner: &mut Inner, now: i64) {
        if inner.round.state != OrchestratorState::WaitingForUpdates {
            return;
        }
        let selected_count = inner.round.selected_clients.len();
        let received = inner.round.updates.len();
        if received >= selected_count || received >= self.config.min_clients_for_round {
            self.aggregate_locked(inner, now);
        }
    }

    pub fn fetch_model(&self, client_id: &str, now: i64) -> Result<Vec<u8>, FetchError> {
        if self.adrm.response.is_blocked(client_id, now) {
            return Err(FetchError::Blocked);
        }
        let inner = self.inner.lock();
        if inner.round.state != OrchestratorState::WaitingForUpdates {
            return Err(FetchError::WrongState);
        }
        if !inner.round.selected_clients.contains(client_id) {
            return Err(FetchError::NotSelected);
        }
        Ok(tensor::encode(&self.model.state()))
    }
}

impl From<SubmitError> for crate::error::RpcFailure {
    fn from(e: SubmitError) -> Self {
        crate::error::RpcFailure::new(e.to_string())
    }
}

impl From<ShareError> for crate::error::RpcFailure {
    fn from(e: ShareError) -> Self {
        crate::error::RpcFailure::new(e.to_string())
    }
}

impl From<FetchError> for crate::error::RpcFailure {
    fn from(e: FetchError) -> Self {
        crate::error::RpcFailure::new(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adrm::model_manager::ModelManager;
    use crate::adrm::response::ResponseSystem;
    use crate::codec::sss;
    use crate::model_registry::Evaluator;
    use crate::types::{DType, Tensor};
    use tempfile::tempdir;

    struct FixedEvaluator;
    impl Evaluator for FixedEvaluator {
        fn evaluate(&self, _parameters: &ParameterMap) -> (f64, f64) {
            (0.9, 0.1)
        }
    }

    fn zero_map() -> ParameterMap {
        let mut m = ParameterMap::new();
        m.insert("w", Tensor::new(DType::F32, vec![2], vec![0u8; 8]));
        m
    }

    struct Harness {
        orchestrator: RoundOrchestrator,
        registry: Arc<ClientRegistry>,
        _dir: tempfile::TempDir,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ClientRegistry::load(dir.path()));
        let model_manager = ModelManager::load(dir.path());
        let adrm = Arc::new(AdrmEngine::new(model_manager, ResponseSystem::load(dir.path())));
        let ppm = Arc::new(PrivacyPolicyAuditor::new(true));
        let sam = Arc::new(SecureAggregationDispatcher::new());
        let model = Arc::new(GlobalModelRegistry::new(
            zero_map(),
            dir.path(),
            dir.path(),
            10,
            0,
        ));
        let evaluator: Arc<dyn Evaluator> = Arc::new(FixedEvaluator);
        let orchestrator =
            RoundOrchestrator::new(config, registry.clone(), adrm, ppm, sam, model, evaluator, 0);
        Harness {
            orchestrator,
            registry,
            _dir: dir,
        }
    }

    fn default_config() -> OrchestratorConfig {
        OrchestratorConfig {
            clients_per_round: 3,
            min_clients_for_round: 2,
            round_timeout_seconds: 100,
            max_rounds: 100,
            aggregation_method: AggregationMethod::FedAdam,
            sss_k: 2,
            tuning: Arc::new(AdrmTuning::new(60, 1.1, 1000, 3.5, 40, 25)),
        }
    }

    #[test]
    fn insufficient_clients_pauses() {
        let h = harness(default_config());
        h.orchestrator.tick(1);
        assert_eq!(h.orchestrator.state(), OrchestratorState::PausedInsufficientClients);
    }

    #[test]
    fn happy_normal_path_aggregates_and_bumps_version() {
        let mut config = default_config();
        config.min_clients_for_round = 3;
        let h = harness(config);
        for name in ["a", "b", "c"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForUpdates);
        assert_eq!(h.orchestrator.selected_clients().len(), 3);

        let payload = tensor::encode(&zero_map());
        for name in ["a", "b", "c"] {
            h.orchestrator
                .receive_update(name, PrivacyMode::Normal, &payload, 2)
                .unwrap();
        }

        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(h.orchestrator.rounds_completed(), 1);
    }

    #[test]
    fn timeout_with_too_few_updates_cancels_round() {
        let mut config = default_config();
        config.round_timeout_seconds = 10;
        let h = harness(config);
        for name in ["a", "b", "c"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        let payload = tensor::encode(&zero_map());
        h.orchestrator
            .receive_update("a", PrivacyMode::Normal, &payload, 2)
            .unwrap();

        h.orchestrator.tick(100);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(h.orchestrator.rounds_completed(), 0);
        // Round counter is not rolled back; the next attempt uses round 2.
        h.orchestrator.tick(101);
        assert_eq!(h.orchestrator.round_number(), 2);
    }

    #[test]
    fn timeout_with_exactly_min_updates_proceeds() {
        let mut config = default_config();
        config.round_timeout_seconds = 10;
        let h = harness(config);
        for name in ["a", "b", "c"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        let payload = tensor::encode(&zero_map());
        for name in ["a", "b"] {
            h.orchestrator
                .receive_update(name, PrivacyMode::Normal, &payload, 2)
                .unwrap();
        }
        h.orchestrator.tick(100);
        assert_eq!(h.orchestrator.rounds_completed(), 1);
    }

    #[test]
    fn not_selected_client_is_rejected() {
        let h = harness(default_config());
        for name in ["a", "b", "c", "d"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        let selected = h.orchestrator.selected_clients();
        let unselected = ["a", "b", "c", "d"]
            .into_iter()
            .find(|n| !selected.contains(&n.to_string()))
            .unwrap();
        let payload = tensor::encode(&zero_map());
        let result = h
            .orchestrator
            .receive_update(unselected, PrivacyMode::Normal, &payload, 2);
        assert!(matches!(result, Err(SubmitError::NotSelected)));
    }

    #[test]
    fn sss_share_below_threshold_does_not_reconstruct() {
        let h = harness(default_config());
        for name in ["a", "b", "c"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        let bundles = sss::split(&zero_map(), 2, 3);
        let one_share = bincode::serialize(&bundles[0]).unwrap();
        h.orchestrator
            .receive_share("a", 0, 3, one_share, 2)
            .unwrap();
        assert_eq!(h.orchestrator.updates_received(), 0);
    }

    #[test]
    fn sss_reconstructs_once_threshold_reached() {
        let h = harness(default_config());
        for name in ["a", "b", "c"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        let bundles = sss::split(&zero_map(), 2, 3);
        for bundle in &bundles[..2] {
            let bytes = bincode::serialize(bundle).unwrap();
            h.orchestrator
                .receive_share("a", bundle.share_index() - 1, 3, bytes, 2)
                .unwrap();
        }
        assert_eq!(h.orchestrator.updates_received(), 1);
    }

    #[test]
    fn share_index_out_of_range_is_rejected() {
        let h = harness(default_config());
        for name in ["a", "b", "c"] {
            h.registry.upsert(name, "127.0.0.1", "tls", 0).unwrap();
        }
        h.orchestrator.tick(1);
        let result = h
            .orchestrator
            .receive_share("a", 5, 3, vec![1, 2, 3], 2);
        assert!(matches!(result, Err(ShareError::IndexOutOfRange { .. })));
    }

    #[test]
    fn fetch_model_denied_outside_waiting_state() {
        let h = harness(default_config());
        h.registry.upsert("a", "127.0.0.1", "tls", 0).unwrap();
        let result = h.orchestrator.fetch_model("a", 1);
        assert!(matches!(result, Err(FetchError::WrongState)));
    }
}
