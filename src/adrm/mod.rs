//! Anomaly detection and response (C6-C8): a per-client Stage-1 classifier
//! with champion/challenger lifecycle, a cross-client Stage-2 outlier pass,
//! and graduated blocking with quarantine storage for rejected updates.

pub mod anomaly_model;
pub mod engine;
pub mod model_manager;
pub mod response;

pub use engine::{AdrmEngine, Stage1Outcome};
pub use model_manager::ModelManager;
pub use response::ResponseSystem;
