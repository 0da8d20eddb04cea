//! Core data model shared across components (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StructureMismatch;

/// Tensor element type. Kept narrow — the server never interprets values,
/// only moves bytes around and checks shape/dtype conformance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    fn elem_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// A single named parameter: dtype, shape, and contiguous raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self { dtype, shape, data }
    }

    pub fn zeros_like(&self) -> Tensor {
        Tensor {
            dtype: self.dtype,
            shape: self.shape.clone(),
            data: vec![0u8; self.data.len()],
        }
    }

    fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    fn conforms_to(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype && self.shape == other.shape
    }

    /// View the raw bytes as `f64`, widening `f32` storage as needed. Used
    /// only by components that need to do arithmetic (ADRM featurizer, SAM).
    pub fn as_f64(&self) -> Vec<f64> {
        match self.dtype {
            DType::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DType::F64 => self
                .data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        }
    }

    /// Build a tensor of the given dtype/shape from `f64` values, narrowing
    /// back to `f32` storage when required.
    pub fn from_f64(dtype: DType, shape: Vec<usize>, values: &[f64]) -> Tensor {
        let mut data = Vec::with_capacity(values.len() * dtype.elem_size());
        match dtype {
            DType::F32 => {
                for v in values {
                    data.extend_from_slice(&(*v as f32).to_le_bytes());
                }
            }
            DType::F64 => {
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        Tensor { dtype, shape, data }
    }
}

/// An ordered mapping from parameter name to tensor value. Conformance
/// (identical key sets, identical per-key shape/dtype) is the single
/// invariant every combining operation in §4 depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterMap(pub BTreeMap<String, Tensor>);

impl ParameterMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.0.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks that `self` and `other` share exactly the same key set and
    /// that every shared key's tensor has identical dtype/shape. Returns the
    /// first offending key on failure — callers never silently pad.
    pub fn check_conformant(&self, other: &ParameterMap) -> Result<(), StructureMismatch> {
        if self.0.len() != other.0.len() {
            return Err(StructureMismatch(format!(
                "key count mismatch: {} vs {}",
                self.0.len(),
                other.0.len()
            )));
        }
        for (name, tensor) in self.0.iter() {
            match other.0.get(name) {
                None => return Err(StructureMismatch(format!("missing key {name}"))),
                Some(other_tensor) if !tensor.conforms_to(other_tensor) => {
                    return Err(StructureMismatch(format!(
                        "shape/dtype mismatch on key {name}"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Flatten every tensor's values, in key order, into one vector. Used by
    /// the ADRM featurizer and by SAM's elementwise arithmetic.
    pub fn flatten(&self) -> Vec<f64> {
        self.0.values().flat_map(|t| t.as_f64()).collect()
    }

    /// Total element count across all tensors, used to size moment buffers.
    pub fn total_elements(&self) -> usize {
        self.0.values().map(|t| t.element_count()).sum()
    }

    pub fn zeros_like(&self) -> ParameterMap {
        ParameterMap(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.zeros_like()))
                .collect(),
        )
    }
}

/// The privacy mode a client declared for a submitted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrivacyMode {
    Normal,
    #[serde(rename = "HE")]
    He,
    #[serde(rename = "SSS")]
    Sss,
}

impl std::fmt::Display for PrivacyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivacyMode::Normal => write!(f, "Normal"),
            PrivacyMode::He => write!(f, "HE"),
            PrivacyMode::Sss => write!(f, "SSS"),
        }
    }
}

/// One update as received by the transport layer, before it is consumed by
/// the orchestrator. Never crosses a round boundary.
#[derive(Debug, Clone)]
pub struct UpdateEnvelope {
    pub client_id: String,
    pub round_number: u64,
    pub privacy_mode: PrivacyMode,
    pub payload: Vec<u8>,
    pub received_ts: i64,
}

/// The currently trusted global model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    pub version: u64,
    pub parameters: ParameterMap,
    pub created_at: i64,
    pub last_evaluated_at: Option<i64>,
    pub best_accuracy_so_far: f64,
    pub rounds_since_last_improvement: u64,
}

impl GlobalModel {
    pub fn new(initial: ParameterMap, now: i64) -> Self {
        Self {
            version: 0,
            parameters: initial,
            created_at: now,
            last_evaluated_at: None,
            best_accuracy_so_far: f64::MIN,
            rounds_since_last_improvement: 0,
        }
    }
}

/// One timestamped reputation delta, carried forward from the original
/// implementation so admin tooling can show a trend, not just a point value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub ts: i64,
    pub delta: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub ip_address: String,
    pub transport_tag: String,
    pub status: ClientStatus,
    pub last_heartbeat_ts: i64,
    pub uptime_start_ts: i64,
    pub reputation: i32,
    pub reputation_history: Vec<ReputationEvent>,
    pub last_successful_round: Option<u64>,
    pub last_round_selected: u64,
    pub participation_history: Vec<u64>,
    /// One-shot flag: true once the client has been selected for a round it
    /// has not yet been told about over the control channel.
    #[serde(default)]
    pub pending_round_notice: bool,
}

impl ClientRecord {
    pub fn new(client_id: String, ip_address: String, transport_tag: String, now: i64) -> Self {
        Self {
            client_id,
            ip_address,
            transport_tag,
            status: ClientStatus::Connected,
            last_heartbeat_ts: now,
            uptime_start_ts: now,
            reputation: 100,
            reputation_history: Vec::new(),
            last_successful_round: None,
            last_round_selected: 0,
            participation_history: Vec::new(),
            pending_round_notice: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub client_id: String,
    pub block_ts: i64,
    pub expiration_ts: i64,
    pub severity: BlockSeverity,
    pub reason: String,
    pub details: String,
}

/// Round orchestrator state (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Idle,
    PausedInsufficientClients,
    ClientSelection,
    WaitingForUpdates,
    Aggregating,
    Finished,
    Standby,
}

/// State owned exclusively by C12 for the round currently in flight.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub round_number: u64,
    pub state: OrchestratorState,
    pub selected_clients: std::collections::BTreeSet<String>,
    pub updates: BTreeMap<String, (ParameterMap, PrivacyMode)>,
    pub shares: BTreeMap<String, BTreeMap<u32, Vec<u8>>>,
    pub share_totals: BTreeMap<String, u32>,
    pub round_start_ts: i64,
    pub round_end_ts: Option<i64>,
}

impl RoundState {
    pub fn new(round_number: u64, now: i64) -> Self {
        Self {
            round_number,
            state: OrchestratorState::Idle,
            selected_clients: Default::default(),
            updates: BTreeMap::new(),
            shares: BTreeMap::new(),
            share_totals: BTreeMap::new(),
            round_start_ts: now,
            round_end_ts: None,
        }
    }
}

/// Append-only metric record, persisted as a JSON array (spec §3, §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub round: u64,
    pub timestamp: i64,
    pub aggregation_method: String,
    pub metrics: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(vals: &[f32], shape: Vec<usize>) -> Tensor {
        let mut data = Vec::new();
        for v in vals {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Tensor::new(DType::F32, shape, data)
    }

    #[test]
    fn conformant_maps_pass() {
        let mut a = ParameterMap::new();
        a.insert("w", tensor(&[1.0, 2.0], vec![2]));
        let mut b = ParameterMap::new();
        b.insert("w", tensor(&[9.0, 9.0], vec![2]));
        assert!(a.check_conformant(&b).is_ok());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut a = ParameterMap::new();
        a.insert("w", tensor(&[1.0, 2.0], vec![2]));
        let mut b = ParameterMap::new();
        b.insert("w", tensor(&[1.0, 2.0, 3.0], vec![3]));
        assert!(a.check_conformant(&b).is_err());
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut a = ParameterMap::new();
        a.insert("w", tensor(&[1.0], vec![1]));
        let mut b = ParameterMap::new();
        b.insert("v", tensor(&[1.0], vec![1]));
        assert!(a.check_conformant(&b).is_err());
    }

    #[test]
    fn f64_round_trip_via_tensor() {
        let t = tensor(&[1.5, -2.25, 3.0], vec![3]);
        let values = t.as_f64();
        let back = Tensor::from_f64(DType::F32, vec![3], &values);
        assert_eq!(t, back);
    }
}
