//! Error taxonomy shared across components.
//!
//! Each component boundary gets its own variant set via `thiserror`; nothing
//! below escapes to an RPC caller directly (see `transport`), which collapses
//! everything to `{success, message}`.

use thiserror::Error;

/// Errors raised while loading configuration or starting the process.
/// Any variant here is fatal: the process logs and exits non-zero.
#[derive(Debug, Error)]
pub enum FatalStartupError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load certificate authority: {0}")]
    CaLoad(String),

    #[error("failed to bind {surface} listener on {addr}: {source}")]
    Bind {
        surface: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that arise while decoding a tensor map, a homomorphically
/// encrypted blob, or a set of secret-shares.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed tensor map: {0}")]
    Malformed(String),

    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum PrivacyDecodeError {
    #[error("homomorphic decrypt failed: {0}")]
    DecryptFailed(String),
}

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("fewer than k={k} bundles supplied ({got} given)")]
    InsufficientShares { k: usize, got: usize },

    #[error("reconstructed length {actual} does not match declared length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("share bundles originate from different splits (bundle id mismatch)")]
    MixedBundles,
}

/// A `ParameterMap` failed the conformance check against another map (most
/// often the current global model).
#[derive(Debug, Error)]
#[error("parameter map is not conformant with the reference map: {0}")]
pub struct StructureMismatch(pub String);

/// Raised by `SAM` when non-conformant inputs reach aggregation, or the
/// FedAdam moment buffers disagree in shape with the current inputs.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("aggregation inputs are not mutually conformant: {0}")]
    NonConformant(String),

    #[error("FedAdam moment buffer shape mismatch for parameter {name}")]
    MomentShapeMismatch { name: String },

    #[error("updates declare mixed privacy modes within one round")]
    MixedPrivacyModes,
}

/// Raised by the PPM policy auditor when a client's declared privacy mode is
/// not acceptable under the current server configuration.
#[derive(Debug, Error)]
#[error("policy auditor rejected privacy mode {mode}: {reason}")]
pub struct PolicyViolation {
    pub mode: String,
    pub reason: String,
}

/// Transport-level authentication failure (enrollment token, or mTLS peer
/// CN that does not match the declared client id).
#[derive(Debug, Error)]
pub enum TransportAuthError {
    #[error("missing client common name on peer certificate")]
    MissingCn,

    #[error("declared client_id {declared} does not match certificate CN {cn}")]
    CnMismatch { declared: String, cn: String },

    #[error("invalid or expired registration token")]
    InvalidToken,
}

/// Non-fatal: logged, never interrupts serving. The next successful
/// snapshot heals the on-disk state.
#[derive(Debug, Error)]
#[error("persistence error writing {path}: {source}")]
pub struct PersistenceError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// The structured-log / `{success, message}` envelope returned to every RPC
/// and admin-REST caller. No internal error variant ever crosses this
/// boundary directly — call sites map onto it explicitly.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcFailure {
    pub success: bool,
    pub message: String,
}

impl RpcFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

macro_rules! impl_rpc_failure_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for RpcFailure {
                fn from(e: $ty) -> Self {
                    RpcFailure::new(e.to_string())
                }
            }
        )+
    };
}

impl_rpc_failure_from!(
    DecodeError,
    PrivacyDecodeError,
    ReconstructError,
    StructureMismatch,
    AggregationError,
    PolicyViolation,
    TransportAuthError,
    PersistenceError,
);
