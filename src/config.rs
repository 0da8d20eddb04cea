//! Server configuration, loaded from JSON (spec §6, §10.2 — a deliberate
//! deviation from the teacher's TOML format, kept for the round-trip shape
//! and restrictive-permissions habit of `Config::load`/`Config::save`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FatalStartupError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub federated_learning: FederatedLearningConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default = "default_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_grace_period_seconds")]
    pub heartbeat_grace_period_seconds: u64,
    #[serde(default = "default_status_check_interval_seconds")]
    pub status_check_interval_seconds: u64,
    #[serde(default)]
    pub adrm: AdrmConfig,
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default = "default_database_dir")]
    pub database: PathBuf,
    #[serde(default = "default_saved_models_dir")]
    pub saved_models: PathBuf,
    /// One-shot shared secret required by the enrollment RPC. Present on
    /// disk, hence the restrictive file permissions on save.
    #[serde(default)]
    pub registration_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedLearningConfig {
    #[serde(default = "default_training_rounds")]
    pub training_rounds: u64,
    #[serde(default = "default_clients_per_round")]
    pub clients_per_round: usize,
    #[serde(default = "default_min_clients_for_round")]
    pub min_clients_for_round: usize,
    #[serde(default = "default_round_timeout_seconds")]
    pub round_timeout_seconds: u64,
    /// Aggregation method used when the privacy mode is not HE.
    #[serde(default = "default_aggregation_method")]
    pub aggregation_method: String,
    #[serde(default = "default_convergence_window")]
    pub convergence_window: u64,
}

impl Default for FederatedLearningConfig {
    fn default() -> Self {
        Self {
            training_rounds: default_training_rounds(),
            clients_per_round: default_clients_per_round(),
            min_clients_for_round: default_min_clients_for_round(),
            round_timeout_seconds: default_round_timeout_seconds(),
            aggregation_method: default_aggregation_method(),
            convergence_window: default_convergence_window(),
        }
    }
}

fn default_training_rounds() -> u64 {
    100
}
fn default_clients_per_round() -> usize {
    3
}
fn default_min_clients_for_round() -> usize {
    2
}
fn default_round_timeout_seconds() -> u64 {
    120
}
fn default_aggregation_method() -> String {
    "fedadam".to_string()
}
fn default_convergence_window() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub he: HeConfig,
    #[serde(default)]
    pub dp: DpConfig,
    #[serde(default)]
    pub sss: SssConfig,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            he: HeConfig::default(),
            dp: DpConfig::default(),
            sss: SssConfig::default(),
        }
    }
}

/// Reconstruction threshold for share-tagged updates. Clients choose their
/// own split size N when they secret-share an update; the server only needs
/// to know k to decide when it holds enough bundles to reconstruct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SssConfig {
    #[serde(default = "default_sss_k")]
    pub k: u32,
}

impl Default for SssConfig {
    fn default() -> Self {
        Self { k: default_sss_k() }
    }
}

fn default_sss_k() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeConfig {
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_delta")]
    pub delta: f64,
}

impl Default for DpConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            delta: default_delta(),
        }
    }
}

fn default_epsilon() -> f64 {
    1.0
}
fn default_delta() -> f64 {
    1e-5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdrmConfig {
    #[serde(default = "default_block_duration_minutes")]
    pub block_duration_minutes: u64,
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: f64,
    #[serde(default = "default_challenger_batch_size")]
    pub challenger_batch_size: usize,
    #[serde(default = "default_cross_client_threshold")]
    pub cross_client_threshold: f64,
    #[serde(default = "default_reputation_penalty_for_block")]
    pub reputation_penalty_for_block: i32,
    #[serde(default = "default_reputation_penalty_low")]
    pub reputation_penalty_low: i32,
}

impl Default for AdrmConfig {
    fn default() -> Self {
        Self {
            block_duration_minutes: default_block_duration_minutes(),
            promotion_threshold: default_promotion_threshold(),
            challenger_batch_size: default_challenger_batch_size(),
            cross_client_threshold: default_cross_client_threshold(),
            reputation_penalty_for_block: default_reputation_penalty_for_block(),
            reputation_penalty_low: default_reputation_penalty_low(),
        }
    }
}

fn default_block_duration_minutes() -> u64 {
    60
}
fn default_promotion_threshold() -> f64 {
    1.1
}
fn default_challenger_batch_size() -> usize {
    32
}
fn default_cross_client_threshold() -> f64 {
    3.5
}
fn default_reputation_penalty_for_block() -> i32 {
    40
}
fn default_reputation_penalty_low() -> i32 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_enrollment_addr")]
    pub enrollment_addr: String,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enrollment_addr: default_enrollment_addr(),
            control_addr: default_control_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_enrollment_addr() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_control_addr() -> String {
    "0.0.0.0:8444".to_string()
}
fn default_admin_addr() -> String {
    "127.0.0.1:8445".to_string()
}

fn default_heartbeat_timeout_seconds() -> u64 {
    90
}
fn default_grace_period_seconds() -> u64 {
    300
}
fn default_status_check_interval_seconds() -> u64 {
    10
}
fn default_database_dir() -> PathBuf {
    PathBuf::from("database")
}
fn default_saved_models_dir() -> PathBuf {
    PathBuf::from("saved_models")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            federated_learning: FederatedLearningConfig::default(),
            privacy: PrivacyConfig::default(),
            heartbeat_timeout_seconds: default_heartbeat_timeout_seconds(),
            heartbeat_grace_period_seconds: default_grace_period_seconds(),
            status_check_interval_seconds: default_status_check_interval_seconds(),
            adrm: AdrmConfig::default(),
            listeners: ListenerConfig::default(),
            database: default_database_dir(),
            saved_models: default_saved_models_dir(),
            registration_token: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, FatalStartupError> {
        let contents = fs::read_to_string(path).map_err(|source| FatalStartupError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|source| FatalStartupError::ConfigParse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects the configurations spec §8's boundary behaviors call out:
    /// zero-valued `clients_per_round`/`min_clients_for_round`.
    pub fn validate(&self) -> Result<(), FatalStartupError> {
        if self.federated_learning.clients_per_round == 0 {
            return Err(FatalStartupError::InvalidConfig(
                "federated_learning.clients_per_round must be > 0".to_string(),
            ));
        }
        if self.federated_learning.min_clients_for_round == 0 {
            return Err(FatalStartupError::InvalidConfig(
                "federated_learning.min_clients_for_round must be > 0".to_string(),
            ));
        }
        if self.federated_learning.min_clients_for_round > self.federated_learning.clients_per_round
        {
            return Err(FatalStartupError::InvalidConfig(
                "min_clients_for_round must not exceed clients_per_round".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flcs")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(
            loaded.federated_learning.clients_per_round,
            config.federated_learning.clients_per_round
        );
    }

    #[test]
    fn rejects_zero_clients_per_round() {
        let mut config = Config::default();
        config.federated_learning.clients_per_round = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_min_clients_for_round() {
        let mut config = Config::default();
        config.federated_learning.min_clients_for_round = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_min_above_selection_size() {
        let mut config = Config::default();
        config.federated_learning.clients_per_round = 2;
        config.federated_learning.min_clients_for_round = 3;
        assert!(config.validate().is_err());
    }
}
