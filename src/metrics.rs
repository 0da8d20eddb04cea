//! Prometheus metrics for the coordination server (spec §4.14 ambient
//! observability). Grounded in the teacher's `rpc::metrics::NodeMetrics`:
//! a `Registry` owning a fixed set of gauges/counters, updated from the
//! in-process component state on every admin `/metrics` scrape and
//! encoded with the text exposition format.

use prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};

use crate::adrm::AdrmEngine;
use crate::model_registry::GlobalModelRegistry;
use crate::orchestrator::RoundOrchestrator;
use crate::registry::ClientRegistry;
use crate::types::OrchestratorState;

pub struct ServerMetrics {
    registry: Registry,
    round_number: IntGauge,
    rounds_completed: IntGauge,
    model_version: IntGauge,
    clients_registered: IntGauge,
    clients_selected: IntGauge,
    clients_blocked: IntGauge,
    updates_received: IntGauge,
    orchestrator_state_code: IntGauge,
    model_converged: Gauge,
}

impl ServerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let round_number = IntGauge::with_opts(Opts::new(
            "flcs_round_number",
            "Current training round number",
        ))
        .expect("static metric options are valid");
        let rounds_completed = IntGauge::with_opts(Opts::new(
            "flcs_rounds_completed_total",
            "Total number of rounds completed since the server started",
        ))
        .expect("static metric options are valid");
        let model_version = IntGauge::with_opts(Opts::new(
            "flcs_model_version",
            "Version counter of the global model",
        ))
        .expect("static metric options are valid");
        let clients_registered = IntGauge::with_opts(Opts::new(
            "flcs_clients_registered",
            "Number of clients known to the registry",
        ))
        .expect("static metric options are valid");
        let clients_selected = IntGauge::with_opts(Opts::new(
            "flcs_clients_selected",
            "Number of clients selected for the in-progress round",
        ))
        .expect("static metric options are valid");
        let clients_blocked = IntGauge::with_opts(Opts::new(
            "flcs_clients_blocked",
            "Number of clients currently blocked by ADRM",
        ))
        .expect("static metric options are valid");
        let updates_received = IntGauge::with_opts(Opts::new(
            "flcs_updates_received",
            "Number of updates received for the in-progress round",
        ))
        .expect("static metric options are valid");
        let orchestrator_state_code = IntGauge::with_opts(Opts::new(
            "flcs_orchestrator_state_code",
            "Numeric encoding of the orchestrator's round state",
        ))
        .expect("static metric options are valid");
        let model_converged = Gauge::with_opts(Opts::new(
            "flcs_model_converged",
            "1 if the global model has converged over the configured window, else 0",
        ))
        .expect("static metric options are valid");

        for metric in [
            &round_number,
            &rounds_completed,
            &model_version,
            &clients_registered,
            &clients_selected,
            &clients_blocked,
            &updates_received,
            &orchestrator_state_code,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .expect("metric names are unique");
        }
        registry
            .register(Box::new(model_converged.clone()))
            .expect("metric names are unique");

        Self {
            registry,
            round_number,
            rounds_completed,
            model_version,
            clients_registered,
            clients_selected,
            clients_blocked,
            updates_received,
            orchestrator_state_code,
            model_converged,
        }
    }

    pub fn refresh(
        &self,
        orchestrator: &RoundOrchestrator,
        registry: &ClientRegistry,
        adrm: &AdrmEngine,
        model: &GlobalModelRegistry,
    ) {
        self.round_number.set(orchestrator.round_number() as i64);
        self.rounds_completed.set(orchestrator.rounds_completed() as i64);
        self.model_version.set(model.version() as i64);
        self.clients_registered.set(registry.all().len() as i64);
        self.clients_selected
            .set(orchestrator.selected_clients().len() as i64);
        self.clients_blocked
            .set(adrm.response.current_blocks().len() as i64);
        self.updates_received
            .set(orchestrator.updates_received() as i64);
        self.orchestrator_state_code
            .set(orchestrator_state_code(orchestrator));
        self.model_converged
            .set(if model.has_converged() { 1.0 } else { 0.0 });
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn orchestrator_state_code(orchestrator: &RoundOrchestrator) -> i64 {
    match orchestrator.state() {
        OrchestratorState::Idle => 0,
        OrchestratorState::PausedInsufficientClients => 1,
        OrchestratorState::ClientSelection => 2,
        OrchestratorState::WaitingForUpdates => 3,
        OrchestratorState::Aggregating => 4,
        OrchestratorState::Finished => 5,
        OrchestratorState::Standby => 6,
    }
}
