//! C10: secure aggregation dispatcher, grounded in
//! `examples/original_source/server/sam/sam.py`. Stateless except for the
//! FedAdam moment buffers, which persist across calls for as long as the
//! process runs (spec §4.10 and §9's reproduced-as-written deviation: the
//! literal, non-bias-corrected `m̂ = m/(1−β1)`, `v̂ = v/(1−β2)`).

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::AggregationError;
use crate::types::{ParameterMap, Tensor};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.99;
const EPSILON: f64 = 1e-8;
const SERVER_LEARNING_RATE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    FedAvg,
    FedAdam,
    HomomorphicAggregation,
}

impl AggregationMethod {
    pub fn name(self) -> &'static str {
        match self {
            AggregationMethod::FedAvg => "fedavg",
            AggregationMethod::FedAdam => "fedadam",
            AggregationMethod::HomomorphicAggregation => "homomorphic_aggregation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fedavg" => Some(AggregationMethod::FedAvg),
            "fedadam" => Some(AggregationMethod::FedAdam),
            "homomorphic_aggregation" => Some(AggregationMethod::HomomorphicAggregation),
            _ => None,
        }
    }
}

struct MomentBuffers {
    m: ParameterMap,
    v: ParameterMap,
}

pub struct SecureAggregationDispatcher {
    moments: Mutex<Option<MomentBuffers>>,
}

impl SecureAggregationDispatcher {
    pub fn new() -> Self {
        Self {
            moments: Mutex::new(None),
        }
    }

    /// Aggregates `deltas` (one conformant `ParameterMap` per client, each
    /// the client-computed delta from `global_params`) via `method`, and
    /// returns the new global parameters. An empty `deltas` list returns
    /// `global_params` unchanged; non-conformant inputs or a moment-buffer
    /// shape mismatch abandon the round via `AggregationError` without
    /// mutating any persistent state.
    pub fn aggregate(
        &self,
        deltas: &[ParameterMap],
        global_params: &ParameterMap,
        method: AggregationMethod,
    ) -> Result<ParameterMap, AggregationError> {
        if deltas.is_empty() {
            return Ok(global_params.clone());
        }
        for delta in deltas {
            delta
                .check_conformant(global_params)
                .map_err(|e| AggregationError::NonConformant(e.0))?;
        }

        let mean_delta = mean_of(deltas, global_params);

        match method {
            AggregationMethod::FedAvg => Ok(add(global_params, &mean_delta)),
            AggregationMethod::FedAdam | AggregationMethod::HomomorphicAggregation => {
                self.fedadam_step(global_params, &mean_delta)
            }
        }
    }

    fn fedadam_step(
        &self,
        global_params: &ParameterMap,
        mean_delta: &ParameterMap,
    ) -> Result<ParameterMap, AggregationError> {
        let mut moments = self.moments.lock();
        let buffers = moments.get_or_insert_with(|| MomentBuffers {
            m: global_params.zeros_like(),
            v: global_params.zeros_like(),
        });

        buffers
            .m
            .check_conformant(global_params)
            .map_err(|e| AggregationError::MomentShapeMismatch { name: e.0 })?;

        let mut new_m = ParameterMap::new();
        let mut new_v = ParameterMap::new();
        let mut update = ParameterMap::new();

        for (name, delta_tensor) in mean_delta.iter() {
            let m_tensor = buffers.m.get(name).expect("checked conformant above");
            let v_tensor = buffers.v.get(name).expect("checked conformant above");
            let global_tensor = global_params.get(name).expect("checked conformant above");

            let g = delta_tensor.as_f64();
            let m_prev = m_tensor.as_f64();
            let v_prev = v_tensor.as_f64();
            let global_vals = global_tensor.as_f64();

            let mut m_next = Vec::with_capacity(g.len());
            let mut v_next = Vec::with_capacity(g.len());
            let mut new_global = Vec::with_capacity(g.len());

            for i in 0..g.len() {
                let m = BETA1 * m_prev[i] + (1.0 - BETA1) * g[i];
                let v = BETA2 * v_prev[i] + (1.0 - BETA2) * g[i] * g[i];
                let m_hat = m / (1.0 - BETA1);
                let v_hat = v / (1.0 - BETA2);
                m_next.push(m);
                v_next.push(v);
                new_global.push(global_vals[i] + SERVER_LEARNING_RATE * m_hat / (v_hat.sqrt() + EPSILON));
            }

            new_m.insert(name.clone(), Tensor::from_f64(delta_tensor.dtype, delta_tensor.shape.clone(), &m_next));
            new_v.insert(name.clone(), Tensor::from_f64(delta_tensor.dtype, delta_tensor.shape.clone(), &v_next));
            update.insert(
                name.clone(),
                Tensor::from_f64(global_tensor.dtype, global_tensor.shape.clone(), &new_global),
            );
        }

        buffers.m = new_m;
        buffers.v = new_v;
        Ok(update)
    }
}

fn mean_of(deltas: &[ParameterMap], shape_reference: &ParameterMap) -> ParameterMap {
    let n = deltas.len() as f64;
    let mut out = ParameterMap::new();
    for (name, reference_tensor) in shape_reference.iter() {
        let len = reference_tensor.as_f64().len();
        let mut acc = vec![0.0f64; len];
        for delta in deltas {
            let values = delta.get(name).expect("checked conformant above").as_f64();
            for (i, v) in values.iter().enumerate() {
                acc[i] += v;
            }
        }
        for v in acc.iter_mut() {
            *v /= n;
        }
        out.insert(
            name.clone(),
            Tensor::from_f64(reference_tensor.dtype, reference_tensor.shape.clone(), &acc),
        );
    }
    out
}

fn add(global_params: &ParameterMap, delta: &ParameterMap) -> ParameterMap {
    let mut out = ParameterMap::new();
    for (name, global_tensor) in global_params.iter() {
        let g = global_tensor.as_f64();
        let d = delta.get(name).expect("checked conformant above").as_f64();
        let summed: Vec<f64> = g.iter().zip(d.iter()).map(|(a, b)| a + b).collect();
        out.insert(
            name.clone(),
            Tensor::from_f64(global_tensor.dtype, global_tensor.shape.clone(), &summed),
        );
    }
    out
}

/// Checks whether a set of declared privacy modes from one round's updates
/// is homogeneous, per the aggregation step's pre-check (spec §4.12): mixed
/// modes abort the round before SAM is ever invoked.
pub fn all_same_privacy_mode<I, T>(modes: I) -> bool
where
    I: IntoIterator<Item = T>,
    T: PartialEq,
{
    let mut iter = modes.into_iter();
    match iter.next() {
        None => true,
        Some(first) => iter.all(|m| m == first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn map(values: &[f64]) -> ParameterMap {
        let mut m = ParameterMap::new();
        m.insert("w", Tensor::from_f64(DType::F64, vec![values.len()], values));
        m
    }

    #[test]
    fn fedavg_adds_mean_delta_to_global() {
        let sam = SecureAggregationDispatcher::new();
        let global = map(&[1.0, 1.0]);
        let deltas = vec![map(&[1.0, 0.0]), map(&[3.0, 0.0])];
        let result = sam
            .aggregate(&deltas, &global, AggregationMethod::FedAvg)
            .unwrap();
        assert_eq!(result.get("w").unwrap().as_f64(), vec![3.0, 1.0]);
    }

    #[test]
    fn empty_deltas_return_global_unchanged() {
        let sam = SecureAggregationDispatcher::new();
        let global = map(&[1.0, 2.0]);
        let result = sam.aggregate(&[], &global, AggregationMethod::FedAdam).unwrap();
        assert_eq!(result, global);
    }

    #[test]
    fn fedadam_moment_buffers_persist_across_calls() {
        let sam = SecureAggregationDispatcher::new();
        let global = map(&[0.0]);
        let deltas = vec![map(&[1.0])];
        let first = sam
            .aggregate(&deltas, &global, AggregationMethod::FedAdam)
            .unwrap();
        let second = sam
            .aggregate(&deltas, &first, AggregationMethod::FedAdam)
            .unwrap();
        assert_ne!(first.get("w").unwrap().as_f64(), second.get("w").unwrap().as_f64());
    }

    #[test]
    fn non_conformant_delta_errors() {
        let sam = SecureAggregationDispatcher::new();
        let global = map(&[1.0, 1.0]);
        let bad_delta = map(&[1.0]);
        assert!(sam
            .aggregate(&[bad_delta], &global, AggregationMethod::FedAvg)
            .is_err());
    }

    #[test]
    fn homomorphic_aggregation_matches_fedadam() {
        let sam_a = SecureAggregationDispatcher::new();
        let sam_b = SecureAggregationDispatcher::new();
        let global = map(&[0.0]);
        let deltas = vec![map(&[2.0])];
        let a = sam_a
            .aggregate(&deltas, &global, AggregationMethod::FedAdam)
            .unwrap();
        let b = sam_b
            .aggregate(&deltas, &global, AggregationMethod::HomomorphicAggregation)
            .unwrap();
        assert_eq!(a, b);
    }
}
