//! C6: ADRM response system. Graduated blocking plus quarantine storage for
//! rejected updates, grounded in
//! `examples/original_source/server/adrm/response_system.py`'s
//! `trigger_response`/`_block_client`/`is_client_blocked`/`unblock_client`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::persistence::write_json_atomic;
use crate::registry::ClientRegistry;
use crate::types::{BlockRecord, BlockSeverity};

const SECONDS_PER_MINUTE: i64 = 60;

pub struct ResponseSystem {
    blocks: Mutex<BTreeMap<String, BlockRecord>>,
    blocklist_path: PathBuf,
    quarantine_dir: PathBuf,
}

impl ResponseSystem {
    pub fn load(database_dir: &Path) -> Self {
        let blocklist_path = database_dir.join("adrm_blocked_clients.json");
        let quarantine_dir = database_dir.join("adrm_quarantine");
        let blocks = std::fs::read_to_string(&blocklist_path)
            .ok()
            .and_then(|s| serde_json::from_str::<BTreeMap<String, BlockRecord>>(&s).ok())
            .unwrap_or_default();
        Self {
            blocks: Mutex::new(blocks),
            blocklist_path,
            quarantine_dir,
        }
    }

    fn persist(&self, blocks: &BTreeMap<String, BlockRecord>) -> Result<(), PersistenceError> {
        write_json_atomic(&self.blocklist_path, blocks)
    }

    /// A `BlockRecord` whose `expiration_ts <= now` is removed on lookup
    /// (spec §3 invariant) rather than swept separately.
    pub fn is_blocked(&self, client_id: &str, now: i64) -> bool {
        let mut blocks = self.blocks.lock();
        match blocks.get(client_id) {
            Some(record) if record.expiration_ts <= now => {
                blocks.remove(client_id);
                let _ = self.persist(&blocks);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Graduated dispatch: `Low` only penalizes reputation; `Medium` blocks
    /// for half the configured duration; `High` blocks for the full
    /// configured duration. Both `Medium` and `High` also penalize.
    #[allow(clippy::too_many_arguments)]
    pub fn trigger_response(
        &self,
        registry: &ClientRegistry,
        client_id: &str,
        severity: BlockSeverity,
        reason: &str,
        details: &str,
        reputation_penalty_for_block: i32,
        reputation_penalty_low: i32,
        block_duration_minutes: u64,
        now: i64,
    ) -> Result<(), PersistenceError> {
        match severity {
            BlockSeverity::Low => {
                registry.penalize(client_id, reputation_penalty_low, reason, now)
            }
            BlockSeverity::Medium => {
                self.block_client(
                    client_id,
                    severity,
                    reason,
                    details,
                    block_duration_minutes / 2,
                    now,
                )?;
                registry.penalize(client_id, reputation_penalty_for_block, reason, now)
            }
            BlockSeverity::High => {
                self.block_client(
                    client_id,
                    severity,
                    reason,
                    details,
                    block_duration_minutes,
                    now,
                )?;
                registry.penalize(client_id, reputation_penalty_for_block, reason, now)
            }
        }
    }

    fn block_client(
        &self,
        client_id: &str,
        severity: BlockSeverity,
        reason: &str,
        details: &str,
        duration_minutes: u64,
        now: i64,
    ) -> Result<(), PersistenceError> {
        let mut blocks = self.blocks.lock();
        blocks.insert(
            client_id.to_string(),
            BlockRecord {
                client_id: client_id.to_string(),
                block_ts: now,
                expiration_ts: now + duration_minutes as i64 * SECONDS_PER_MINUTE,
                severity,
                reason: reason.to_string(),
                details: details.to_string(),
            },
        );
        self.persist(&blocks)
    }

    /// Admin override: lifts a block regardless of its expiration.
    pub fn unblock_client(&self, client_id: &str) -> Result<bool, PersistenceError> {
        let mut blocks = self.blocks.lock();
        let removed = blocks.remove(client_id).is_some();
        if removed {
            self.persist(&blocks)?;
        }
        Ok(removed)
    }

    pub fn current_blocks(&self) -> Vec<BlockRecord> {
        self.blocks.lock().values().cloned().collect()
    }

    /// Persists a rejected update for later forensic inspection, per
    /// `database/adrm_quarantine/<round>_<client_id>.bin`.
    pub fn quarantine_update(
        &self,
        round: u64,
        client_id: &str,
        bytes: &[u8],
    ) -> Result<(), PersistenceError> {
        let path = self
            .quarantine_dir
            .join(format!("{round}_{client_id}.bin"));
        crate::persistence::write_atomic(&path, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (ResponseSystem, ClientRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let response = ResponseSystem::load(dir.path());
        let registry = ClientRegistry::load(dir.path());
        registry.upsert("alice", "127.0.0.1", "tls", 0).unwrap();
        (response, registry, dir)
    }

    #[test]
    fn low_severity_only_penalizes() {
        let (response, registry, _dir) = setup();
        response
            .trigger_response(&registry, "alice", BlockSeverity::Low, "r", "d", 40, 25, 60, 0)
            .unwrap();
        assert!(!response.is_blocked("alice", 0));
        assert_eq!(registry.get("alice").unwrap().reputation, 75);
    }

    #[test]
    fn high_severity_blocks_and_penalizes() {
        let (response, registry, _dir) = setup();
        response
            .trigger_response(&registry, "alice", BlockSeverity::High, "r", "d", 40, 25, 60, 0)
            .unwrap();
        assert!(response.is_blocked("alice", 100));
        assert!(!response.is_blocked("alice", 60 * 61));
        assert_eq!(registry.get("alice").unwrap().reputation, 60);
    }

    #[test]
    fn unblock_client_lifts_block_early() {
        let (response, registry, _dir) = setup();
        response
            .trigger_response(&registry, "alice", BlockSeverity::High, "r", "d", 40, 25, 60, 0)
            .unwrap();
        assert!(response.unblock_client("alice").unwrap());
        assert!(!response.is_blocked("alice", 1));
    }

    #[test]
    fn quarantine_writes_file() {
        let dir = tempdir().unwrap();
        let response = ResponseSystem::load(dir.path());
        response.quarantine_update(3, "alice", b"payload").unwrap();
        let path = dir.path().join("adrm_quarantine").join("3_alice.bin");
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }
}
