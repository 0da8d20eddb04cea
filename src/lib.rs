//! FLCS node library — federated learning coordination server.
//!
//! Provides the coordination control plane for a federated learning
//! deployment: tensor/HE/SSS codecs, a certificate authority for client
//! enrollment, the client registry, the two-stage anomaly detection and
//! response system, the privacy policy auditor, secure aggregation, the
//! global model registry, and the round orchestrator tying them together
//! behind the mTLS control channel, the plaintext enrollment channel, and
//! the admin REST surface.

#![deny(clippy::print_stdout)]

pub mod adrm;
pub mod ca;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model_registry;
pub mod orchestrator;
pub mod persistence;
pub mod ppm;
pub mod registry;
pub mod sam;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod util;

// Re-export commands module for the CLI binary. `commands` legitimately
// prints to stdout, hence it is exempted from the crate-wide lint above.
#[allow(clippy::print_stdout)]
pub mod commands;
