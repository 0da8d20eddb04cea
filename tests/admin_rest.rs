//! End-to-end HTTP round trip against the admin REST surface (SPEC_FULL
//! §10.6): the one surface worth a `tests/` integration suite rather than an
//! in-module `#[cfg(test)]` block, since it actually needs a bound socket
//! and a real HTTP client round trip instead of in-process assertions.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use flcs::adrm::model_manager::ModelManager;
use flcs::adrm::response::ResponseSystem;
use flcs::adrm::AdrmEngine;
use flcs::metrics::ServerMetrics;
use flcs::model_registry::{Evaluator, GlobalModelRegistry};
use flcs::orchestrator::{AdrmTuning, OrchestratorConfig, RoundOrchestrator};
use flcs::ppm::PrivacyPolicyAuditor;
use flcs::registry::ClientRegistry;
use flcs::sam::{AggregationMethod, SecureAggregationDispatcher};
use flcs::telemetry::LogTail;
use flcs::transport::admin::{self, AdminState};
use flcs::types::{DType, ParameterMap, Tensor};

struct FixedEvaluator;
impl Evaluator for FixedEvaluator {
    fn evaluate(&self, _parameters: &ParameterMap) -> (f64, f64) {
        (0.75, 0.2)
    }
}

fn sample_params() -> ParameterMap {
    let mut m = ParameterMap::new();
    m.insert("w", Tensor::new(DType::F32, vec![1], vec![0u8; 4]));
    m
}

async fn spawn_admin_server() -> (SocketAddr, tempfile::TempDir) {
    spawn_admin_server_with(|_model_manager| {}).await
}

async fn spawn_admin_server_with(
    prepare_model_manager: impl FnOnce(&ModelManager),
) -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ClientRegistry::load(dir.path()));
    let model_manager = ModelManager::load(dir.path());
    prepare_model_manager(&model_manager);
    let adrm = Arc::new(AdrmEngine::new(model_manager, ResponseSystem::load(dir.path())));
    let ppm = Arc::new(PrivacyPolicyAuditor::new(true));
    let sam = Arc::new(SecureAggregationDispatcher::new());
    let model = Arc::new(GlobalModelRegistry::new(
        sample_params(),
        dir.path(),
        dir.path(),
        10,
        0,
    ));
    let tuning = Arc::new(AdrmTuning::new(60, 1.1, 32, 3.5, 40, 25));
    let config = OrchestratorConfig {
        clients_per_round: 3,
        min_clients_for_round: 2,
        round_timeout_seconds: 100,
        max_rounds: 100,
        aggregation_method: AggregationMethod::FedAdam,
        sss_k: 2,
        tuning: tuning.clone(),
    };
    let evaluator: Arc<dyn Evaluator> = Arc::new(FixedEvaluator);
    let orchestrator = Arc::new(RoundOrchestrator::new(
        config,
        registry.clone(),
        adrm.clone(),
        ppm,
        sam,
        model.clone(),
        evaluator,
        0,
    ));

    let state = Arc::new(AdminState {
        registry,
        orchestrator,
        adrm,
        model,
        tuning,
        logs: LogTail::new(100),
        metrics: Arc::new(ServerMetrics::new()),
        started_at: 0,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    tokio::spawn(async move {
        let _ = admin::serve(addr, state).await;
    });

    // Give the listener a moment to bind before the first request lands.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, dir)
}

fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8_lossy(&raw);
    let mut parts = raw.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default().to_string();

    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    (status, body)
}

fn http_post(addr: SocketAddr, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8_lossy(&raw);
    let mut parts = raw.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default().to_string();

    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    (status, body)
}

#[tokio::test]
async fn status_endpoint_reports_initial_state() {
    let (addr, _dir) = spawn_admin_server().await;
    let (status, body) = http_get(addr, "/api/status");
    assert_eq!(status, 200);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["model_version"], 0);
    assert_eq!(json["clients_registered"], 0);
    assert_eq!(json["clients_blocked"], 0);
}

#[tokio::test]
async fn overview_endpoint_includes_orchestrator_fields() {
    let (addr, _dir) = spawn_admin_server().await;
    let (status, body) = http_get(addr, "/api/overview");
    assert_eq!(status, 200);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(json.get("selected_clients").is_some());
    assert!(json.get("updates_received").is_some());
    assert_eq!(json["model_converged"], false);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (addr, _dir) = spawn_admin_server().await;
    let (status, _body) = http_get(addr, "/api/does-not-exist");
    assert_eq!(status, 404);
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text_format() {
    let (addr, _dir) = spawn_admin_server().await;
    let (status, body) = http_get(addr, "/metrics");
    assert_eq!(status, 200);
    assert!(body.contains("flcs_round_number"));
}

#[tokio::test]
async fn evaluate_endpoint_promotes_a_winning_challenger() {
    let (addr, _dir) = spawn_admin_server_with(|model_manager| {
        model_manager
            .buffer_for_challenger(vec![1.0, 0.0, 0.0, 1.0, 1.0], 2)
            .unwrap();
        model_manager
            .buffer_for_challenger(vec![1.1, 0.0, 0.0, 1.1, 1.1], 2)
            .unwrap();
    })
    .await;

    let body = serde_json::json!({
        "features": [[1.0, 0.0, 0.0, 1.0, 1.0], [500.0, 0.0, 0.0, 500.0, 500.0]],
        "labels": [false, true],
    })
    .to_string();
    let (status, body) = http_post(addr, "/api/admin/adrm/evaluate", &body);
    assert_eq!(status, 200);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["promoted"], true);
}

#[tokio::test]
async fn evaluate_endpoint_rejects_mismatched_lengths() {
    let (addr, _dir) = spawn_admin_server().await;
    let body = serde_json::json!({ "features": [[1.0]], "labels": [] }).to_string();
    let (status, _body) = http_post(addr, "/api/admin/adrm/evaluate", &body);
    assert_eq!(status, 400);
}
