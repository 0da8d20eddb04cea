//! C5: client registry. An in-memory `ClientRecord` map guarded by a single
//! lock (never held across network I/O), snapshotted to
//! `database/client_data.json` after every mutation.
//!
//! Grounded in the teacher's `network/reputation.rs` (EMA-scored peer
//! tracking, `is_banned`-style gating), generalized to the fairness+quality
//! selection formula and persisted reputation history spec §4.5 requires.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::persistence::write_json_atomic;
use crate::types::{ClientRecord, ClientStatus, ReputationEvent};

/// Candidates below this reputation are never selected, per spec §4.5.
const SELECTION_REPUTATION_FLOOR: i32 = 50;
const LATENCY_CAP_MS: f64 = 500.0;
const UPTIME_CAP_SECONDS: f64 = 3600.0;

struct Inner {
    clients: BTreeMap<String, ClientRecord>,
    /// Most recent observed round-trip latency, kept outside `ClientRecord`
    /// because it is a live transport signal, not persisted history.
    latencies_ms: HashMap<String, f64>,
}

pub struct ClientRegistry {
    inner: Mutex<Inner>,
    snapshot_path: PathBuf,
}

impl ClientRegistry {
    /// Loads `database/client_data.json` if present, otherwise starts empty.
    pub fn load(database_dir: &Path) -> Self {
        let snapshot_path = database_dir.join("client_data.json");
        let clients = std::fs::read_to_string(&snapshot_path)
            .ok()
            .and_then(|s| serde_json::from_str::<BTreeMap<String, ClientRecord>>(&s).ok())
            .unwrap_or_default();
        Self {
            inner: Mutex::new(Inner {
                clients,
                latencies_ms: HashMap::new(),
            }),
            snapshot_path,
        }
    }

    fn persist(&self, inner: &Inner) -> Result<(), PersistenceError> {
        write_json_atomic(&self.snapshot_path, &inner.clients)
    }

    /// Creates a record on first successful CSR signing or first mTLS
    /// registration; on a later call for a known client, marks it connected
    /// and resets `uptime_start_ts` (spec §3 invariant).
    pub fn upsert(
        &self,
        client_id: &str,
        ip_address: &str,
        transport_tag: &str,
        now: i64,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        inner
            .clients
            .entry(client_id.to_string())
            .and_modify(|c| {
                c.status = ClientStatus::Connected;
                c.ip_address = ip_address.to_string();
                c.transport_tag = transport_tag.to_string();
                c.last_heartbeat_ts = now;
                c.uptime_start_ts = now;
            })
            .or_insert_with(|| {
                ClientRecord::new(client_id.to_string(), ip_address.to_string(), transport_tag.to_string(), now)
            });
        self.persist(&inner)
    }

    /// Bumps `last_heartbeat_ts`; if the client was disconnected, transitions
    /// it back to connected and resets `uptime_start_ts`. No-op (returns
    /// `false`) for an unknown client.
    pub fn heartbeat(&self, client_id: &str, now: i64) -> Result<bool, PersistenceError> {
        let mut inner = self.inner.lock();
        let found = match inner.clients.get_mut(client_id) {
            Some(record) => {
                if record.status == ClientStatus::Disconnected {
                    record.status = ClientStatus::Connected;
                    record.uptime_start_ts = now;
                }
                record.last_heartbeat_ts = now;
                true
            }
            None => false,
        };
        if found {
            self.persist(&inner)?;
        }
        Ok(found)
    }

    pub fn record_latency(&self, client_id: &str, latency_ms: f64) {
        let mut inner = self.inner.lock();
        inner.latencies_ms.insert(client_id.to_string(), latency_ms);
    }

    pub fn deregister(&self, client_id: &str) -> Result<bool, PersistenceError> {
        let mut inner = self.inner.lock();
        let removed = inner.clients.remove(client_id).is_some();
        inner.latencies_ms.remove(client_id);
        if removed {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    /// Subtracts `penalty` from reputation (clamped to `[0, 100]`), appending
    /// a timestamped entry to `reputation_history`.
    pub fn penalize(
        &self,
        client_id: &str,
        penalty: i32,
        reason: &str,
        now: i64,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.clients.get_mut(client_id) {
            record.reputation = (record.reputation - penalty).clamp(0, 100);
            record.reputation_history.push(ReputationEvent {
                ts: now,
                delta: -penalty,
                reason: reason.to_string(),
            });
        }
        self.persist(&inner)
    }

    pub fn record_round_participation(
        &self,
        client_id: &str,
        round: u64,
        succeeded: bool,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.clients.get_mut(client_id) {
            record.participation_history.push(round);
            if succeeded {
                record.last_successful_round = Some(round);
            }
        }
        self.persist(&inner)
    }

    pub fn mark_selected(&self, client_id: &str, round: u64) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.clients.get_mut(client_id) {
            record.last_round_selected = round;
            record.pending_round_notice = true;
        }
        self.persist(&inner)
    }

    pub fn clear_pending_round_notice(&self, client_id: &str) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.clients.get_mut(client_id) {
            record.pending_round_notice = false;
        }
        self.persist(&inner)
    }

    /// Clears a client's learned reputation/participation history without
    /// deregistering it (admin REST `DELETE /api/admin/adrm/history/{id}`).
    /// Reputation itself resets to the initial value of 100.
    pub fn reset_history(&self, client_id: &str) -> Result<bool, PersistenceError> {
        let mut inner = self.inner.lock();
        let found = match inner.clients.get_mut(client_id) {
            Some(record) => {
                record.reputation = 100;
                record.reputation_history.clear();
                record.participation_history.clear();
                record.last_successful_round = None;
                true
            }
            None => false,
        };
        if found {
            self.persist(&inner)?;
        }
        Ok(found)
    }

    pub fn get(&self, client_id: &str) -> Option<ClientRecord> {
        self.inner.lock().clients.get(client_id).cloned()
    }

    pub fn all(&self) -> Vec<ClientRecord> {
        self.inner.lock().clients.values().cloned().collect()
    }

    /// Number of connected, not-blocked, `reputation > 50` clients.
    pub fn eligible_count(&self, is_blocked: impl Fn(&str) -> bool) -> usize {
        let inner = self.inner.lock();
        inner
            .clients
            .values()
            .filter(|c| {
                c.status == ClientStatus::Connected
                    && c.reputation > SELECTION_REPUTATION_FLOOR
                    && !is_blocked(&c.client_id)
            })
            .count()
    }

    /// Fairness+quality selection (spec §4.5): candidates are connected,
    /// `reputation > 50`, not currently blocked. Sorted ascending by
    /// `last_round_selected` (older first), ties broken by descending score.
    /// Fewer than `k` eligible candidates yields an empty list — the caller
    /// treats that as "pause".
    pub fn select_for_round(&self, k: usize, is_blocked: impl Fn(&str) -> bool) -> Vec<String> {
        let inner = self.inner.lock();
        let mut candidates: Vec<&ClientRecord> = inner
            .clients
            .values()
            .filter(|c| {
                c.status == ClientStatus::Connected
                    && c.reputation > SELECTION_REPUTATION_FLOOR
                    && !is_blocked(&c.client_id)
            })
            .collect();

        if candidates.len() < k {
            return Vec::new();
        }

        candidates.sort_by(|a, b| {
            a.last_round_selected.cmp(&b.last_round_selected).then_with(|| {
                let score_a = self.score(a, &inner.latencies_ms);
                let score_b = self.score(b, &inner.latencies_ms);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        candidates
            .into_iter()
            .take(k)
            .map(|c| c.client_id.clone())
            .collect()
    }

    fn score(&self, record: &ClientRecord, latencies_ms: &HashMap<String, f64>) -> f64 {
        let now = crate::util::now_unix();
        let uptime_seconds = (now - record.uptime_start_ts).max(0) as f64;
        let latency = latencies_ms.get(&record.client_id).copied().unwrap_or(LATENCY_CAP_MS);

        0.6 * (record.reputation as f64 / 100.0)
            + 0.3 * (uptime_seconds / UPTIME_CAP_SECONDS).min(1.0)
            + 0.1 * (1.0 - latency.min(LATENCY_CAP_MS) / LATENCY_CAP_MS)
    }

    /// Heartbeat checker sweep: `Connected` clients whose last heartbeat is
    /// older than `timeout_seconds` transition to `Disconnected`;
    /// `Disconnected` clients older than `timeout_seconds +
    /// grace_period_seconds` are deregistered entirely.
    pub fn sweep_heartbeats(
        &self,
        now: i64,
        timeout_seconds: u64,
        grace_period_seconds: u64,
    ) -> Result<Vec<String>, PersistenceError> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        let timeout = timeout_seconds as i64;
        let grace = grace_period_seconds as i64;

        for record in inner.clients.values_mut() {
            let idle = now - record.last_heartbeat_ts;
            if record.status == ClientStatus::Connected && idle > timeout {
                record.status = ClientStatus::Disconnected;
            }
            if record.status == ClientStatus::Disconnected && idle > timeout + grace {
                expired.push(record.client_id.clone());
            }
        }
        for client_id in &expired {
            inner.clients.remove(client_id);
            inner.latencies_ms.remove(client_id);
        }
        self.persist(&inner)?;
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (ClientRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (ClientRegistry::load(dir.path()), dir)
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let (reg, _dir) = registry();
        reg.upsert("alice", "127.0.0.1", "tls", 1000).unwrap();
        let record = reg.get("alice").unwrap();
        assert_eq!(record.reputation, 100);
        assert_eq!(record.status, ClientStatus::Connected);
    }

    #[test]
    fn heartbeat_reconnects_disconnected_client() {
        let (reg, _dir) = registry();
        reg.upsert("alice", "127.0.0.1", "tls", 1000).unwrap();
        reg.sweep_heartbeats(1000 + 10_000, 90, 300).unwrap();
        assert_eq!(reg.get("alice").unwrap().status, ClientStatus::Disconnected);
        reg.heartbeat("alice", 2_000_000).unwrap();
        let record = reg.get("alice").unwrap();
        assert_eq!(record.status, ClientStatus::Connected);
        assert_eq!(record.uptime_start_ts, 2_000_000);
    }

    #[test]
    fn sweep_removes_long_disconnected_clients() {
        let (reg, _dir) = registry();
        reg.upsert("alice", "127.0.0.1", "tls", 0).unwrap();
        let expired = reg.sweep_heartbeats(100_000, 90, 300).unwrap();
        assert_eq!(expired, vec!["alice".to_string()]);
        assert!(reg.get("alice").is_none());
    }

    #[test]
    fn penalize_clamps_to_zero() {
        let (reg, _dir) = registry();
        reg.upsert("alice", "127.0.0.1", "tls", 0).unwrap();
        reg.penalize("alice", 1000, "test", 1).unwrap();
        assert_eq!(reg.get("alice").unwrap().reputation, 0);
    }

    #[test]
    fn selection_excludes_low_reputation_clients() {
        let (reg, _dir) = registry();
        reg.upsert("alice", "127.0.0.1", "tls", 0).unwrap();
        reg.penalize("alice", 60, "test", 1).unwrap();
        let selected = reg.select_for_round(1, |_| false);
        assert!(selected.is_empty());
    }

    #[test]
    fn fewer_than_k_eligible_yields_empty() {
        let (reg, _dir) = registry();
        reg.upsert("alice", "127.0.0.1", "tls", 0).unwrap();
        let selected = reg.select_for_round(2, |_| false);
        assert!(selected.is_empty());
    }

    #[test]
    fn selection_breaks_ties_by_last_round_selected() {
        let (reg, _dir) = registry();
        reg.upsert("a", "127.0.0.1", "tls", 0).unwrap();
        reg.upsert("b", "127.0.0.1", "tls", 0).unwrap();
        reg.mark_selected("a", 5).unwrap();
        let selected = reg.select_for_round(1, |_| false);
        assert_eq!(selected, vec!["b".to_string()]);
    }
}
