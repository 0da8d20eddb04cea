//! Admin REST surface (spec §4.13/§6): plaintext JSON, bound to a local
//! management port. Grounded in the teacher's `rpc::start_rpc_server`
//! accept-loop/`service_fn` shape and its CORS helpers (`check_cors_origin`,
//! `cors_response`), adapted from one JSON-RPC 2.0 endpoint into REST
//! path+method routing over the orchestrator, registry, ADRM, and model
//! components.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::adrm::AdrmEngine;
use crate::error::FatalStartupError;
use crate::metrics::ServerMetrics;
use crate::model_registry::GlobalModelRegistry;
use crate::orchestrator::{AdrmTuning, RoundOrchestrator};
use crate::registry::ClientRegistry;
use crate::telemetry::LogTail;
use crate::types::PrivacyMode;

/// Everything the admin surface needs, handed in by `commands::run`. No
/// field here is owned exclusively by this module — it only presents what
/// the other components already expose.
pub struct AdminState {
    pub registry: Arc<ClientRegistry>,
    pub orchestrator: Arc<RoundOrchestrator>,
    pub adrm: Arc<AdrmEngine>,
    pub model: Arc<GlobalModelRegistry>,
    pub tuning: Arc<AdrmTuning>,
    pub logs: Arc<LogTail>,
    pub metrics: Arc<ServerMetrics>,
    pub started_at: i64,
}

pub async fn serve(addr: SocketAddr, state: Arc<AdminState>) -> Result<(), FatalStartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| FatalStartupError::Bind {
            surface: "admin",
            addr: addr.to_string(),
            source,
        })?;
    info!(%addr, "admin REST listener bound");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "admin accept failed");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, state.clone(), peer));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %err, "admin connection error");
            }
        });
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
    _peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let allowed_origin = check_cors_origin(
        req.headers()
            .get("origin")
            .and_then(|v| v.to_str().ok()),
    );

    if req.method() == Method::OPTIONS {
        return Ok(cors_response(
            Response::new(Full::new(Bytes::new())),
            allowed_origin.as_deref(),
        ));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read admin request body");
            Bytes::new()
        }
    };

    let response = route(&method, &path, &query, &body_bytes, &state);
    Ok(cors_response(response, allowed_origin.as_deref()))
}

fn route(
    method: &Method,
    path: &str,
    query: &str,
    body: &Bytes,
    state: &AdminState,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/api/status") => json_ok(status_payload(state)),
        (&Method::GET, "/api/overview") => json_ok(overview_payload(state)),
        (&Method::GET, "/api/orchestrator_progress") => json_ok(orchestrator_progress_payload(state)),
        (&Method::GET, "/api/model") => json_ok(model_payload(state)),
        (&Method::GET, "/api/model/bytes") => model_bytes_response(state),
        (&Method::POST, "/api/submit_update") => submit_update(body, state),
        (&Method::GET, "/api/client_health") => json_ok(client_health_payload(state)),
        (&Method::GET, "/api/logs") => json_ok(logs_payload(query, state)),
        (&Method::GET, "/metrics") => metrics_response(state),
        (&Method::POST, path) if path.starts_with("/api/admin/adrm/unblock/") => {
            let client_id = &path["/api/admin/adrm/unblock/".len()..];
            unblock(client_id, state)
        }
        (&Method::DELETE, path) if path.starts_with("/api/admin/adrm/history/") => {
            let client_id = &path["/api/admin/adrm/history/".len()..];
            reset_history(client_id, state)
        }
        (&Method::PUT, "/api/admin/adrm/config") => update_adrm_config(body, state),
        (&Method::POST, "/api/admin/adrm/evaluate") => evaluate_adrm(body, state),
        (&Method::GET, path) if path.starts_with("/api/module_status/") => {
            let module = &path["/api/module_status/".len()..];
            module_status(module, state)
        }
        _ => not_found(),
    }
}

fn status_payload(state: &AdminState) -> Value {
    json!({
        "orchestrator_state": format!("{:?}", state.orchestrator.state()),
        "round_number": state.orchestrator.round_number(),
        "rounds_completed": state.orchestrator.rounds_completed(),
        "model_version": state.model.version(),
        "clients_registered": state.registry.all().len(),
        "clients_blocked": state.adrm.response.current_blocks().len(),
        "uptime_seconds": crate::util::now_unix() - state.started_at,
    })
}

fn overview_payload(state: &AdminState) -> Value {
    let mut overview = status_payload(state).as_object().cloned().unwrap_or_default();
    overview.insert(
        "selected_clients".to_string(),
        json!(state.orchestrator.selected_clients()),
    );
    overview.insert(
        "updates_received".to_string(),
        json!(state.orchestrator.updates_received()),
    );
    overview.insert(
        "model_converged".to_string(),
        json!(state.model.has_converged()),
    );
    overview.insert(
        "recent_metrics".to_string(),
        json!(state.model.metrics_history().into_iter().rev().take(10).collect::<Vec<_>>()),
    );
    Value::Object(overview)
}

fn orchestrator_progress_payload(state: &AdminState) -> Value {
    json!({
        "orchestrator_state": format!("{:?}", state.orchestrator.state()),
        "round_number": state.orchestrator.round_number(),
        "selected_clients": state.orchestrator.selected_clients(),
        "updates_received": state.orchestrator.updates_received(),
    })
}

fn model_payload(state: &AdminState) -> Value {
    json!({
        "version": state.model.version(),
        "has_converged": state.model.has_converged(),
        "metrics_history_len": state.model.metrics_history().len(),
        "aggregation_window": state.model.first_and_last_aggregation().map(
            |(first_round, first_ts, last_round, last_ts)| json!({
                "first_round": first_round,
                "first_ts": first_ts,
                "last_round": last_round,
                "last_ts": last_ts,
            })
        ),
    })
}

fn model_bytes_response(state: &AdminState) -> Response<Full<Bytes>> {
    let encoded = crate::codec::tensor::encode(&state.model.state());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .body(Full::new(Bytes::from(encoded)))
        .unwrap()
}

#[derive(Deserialize)]
struct SubmitUpdateRequest {
    client_id: String,
    privacy_mode: PrivacyMode,
    payload_hex: String,
}

/// Testing-only bypass of the mTLS control channel (spec §6): lets an
/// operator or integration test drive the round without provisioning a
/// client certificate. Still routed through the orchestrator's real
/// validation (selection, blocking, stage-1) — this endpoint only replaces
/// the transport, not the semantics.
fn submit_update(body: &Bytes, state: &AdminState) -> Response<Full<Bytes>> {
    let request: SubmitUpdateRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request(&format!("malformed submit_update request: {e}")),
    };
    let payload = match hex::decode(&request.payload_hex) {
        Ok(bytes) => bytes,
        Err(e) => return bad_request(&format!("invalid payload_hex: {e}")),
    };
    let now = crate::util::now_unix();
    match state
        .orchestrator
        .receive_update(&request.client_id, request.privacy_mode, &payload, now)
    {
        Ok(()) => json_ok(json!({ "success": true, "message": "update accepted" })),
        Err(e) => json_ok(json!({ "success": false, "message": e.to_string() })),
    }
}

fn client_health_payload(state: &AdminState) -> Value {
    json!(state.registry.all())
}

fn logs_payload(query: &str, state: &AdminState) -> Value {
    let limit = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("limit="))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);
    json!(state.logs.tail(limit))
}

fn metrics_response(state: &AdminState) -> Response<Full<Bytes>> {
    state.metrics.refresh(
        &state.orchestrator,
        &state.registry,
        &state.adrm,
        &state.model,
    );
    match state.metrics.encode() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(text)))
            .unwrap(),
        Err(e) => internal_error(&e.to_string()),
    }
}

fn unblock(client_id: &str, state: &AdminState) -> Response<Full<Bytes>> {
    match state.adrm.response.unblock_client(client_id) {
        Ok(true) => json_ok(json!({ "success": true, "message": "client unblocked" })),
        Ok(false) => json_ok(json!({ "success": false, "message": "client was not blocked" })),
        Err(e) => internal_error(&e.to_string()),
    }
}

fn reset_history(client_id: &str, state: &AdminState) -> Response<Full<Bytes>> {
    match state.registry.reset_history(client_id) {
        Ok(true) => json_ok(json!({ "success": true, "message": "history reset" })),
        Ok(false) => json_ok(json!({ "success": false, "message": "unknown client_id" })),
        Err(e) => internal_error(&e.to_string()),
    }
}

#[derive(Deserialize, Default)]
struct AdrmConfigPatch {
    block_duration_minutes: Option<u64>,
    promotion_threshold: Option<f64>,
    challenger_batch_size: Option<usize>,
    cross_client_threshold: Option<f64>,
    reputation_penalty_for_block: Option<i32>,
    reputation_penalty_low: Option<i32>,
}

fn update_adrm_config(body: &Bytes, state: &AdminState) -> Response<Full<Bytes>> {
    let patch: AdrmConfigPatch = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => return bad_request(&format!("malformed config patch: {e}")),
    };
    state.tuning.apply_patch(
        patch.block_duration_minutes,
        patch.promotion_threshold,
        patch.challenger_batch_size,
        patch.cross_client_threshold,
        patch.reputation_penalty_for_block,
        patch.reputation_penalty_low,
    );
    let (block_duration_minutes, promotion_threshold, challenger_batch_size, cross_client_threshold, reputation_penalty_for_block, reputation_penalty_low) =
        state.tuning.snapshot();
    json_ok(json!({
        "success": true,
        "message": "adrm config updated",
        "block_duration_minutes": block_duration_minutes,
        "promotion_threshold": promotion_threshold,
        "challenger_batch_size": challenger_batch_size,
        "cross_client_threshold": cross_client_threshold,
        "reputation_penalty_for_block": reputation_penalty_for_block,
        "reputation_penalty_low": reputation_penalty_low,
    }))
}

#[derive(Deserialize)]
struct EvaluateAdrmRequest {
    features: Vec<Vec<f64>>,
    labels: Vec<bool>,
}

/// Spec §4.8 "evaluate and swap": an operator supplies a labeled batch
/// (e.g. from a held-out audit sample), and the champion/challenger ADRM
/// classifiers are scored against it by F1, with the challenger promoted on
/// a decisive win.
fn evaluate_adrm(body: &Bytes, state: &AdminState) -> Response<Full<Bytes>> {
    let request: EvaluateAdrmRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return bad_request(&format!("malformed evaluate request: {e}")),
    };
    if request.features.len() != request.labels.len() {
        return bad_request("features and labels must be the same length");
    }
    let (_, promotion_threshold, ..) = state.tuning.snapshot();
    match state
        .adrm
        .evaluate_and_swap(&request.features, &request.labels, promotion_threshold)
    {
        Ok(promoted) => json_ok(json!({ "success": true, "promoted": promoted })),
        Err(e) => internal_error(&e.to_string()),
    }
}

fn module_status(module: &str, state: &AdminState) -> Response<Full<Bytes>> {
    let payload = match module {
        "mm" => json!({
            "module": "model_manager",
            "description": "champion/challenger anomaly model lifecycle",
        }),
        "sam" => json!({
            "module": "sam",
            "description": "secure aggregation dispatcher",
        }),
        "adrm" => json!({
            "module": "adrm",
            "blocked_clients": state.adrm.response.current_blocks().len(),
        }),
        "ppm" => json!({
            "module": "ppm",
            "description": "privacy policy auditor",
        }),
        "scpm" => json!({
            "module": "scpm",
            "description": "mTLS control channel / secure channel policy",
        }),
        "orchestrator" => json!({
            "module": "orchestrator",
            "state": format!("{:?}", state.orchestrator.state()),
            "round_number": state.orchestrator.round_number(),
        }),
        _ => return not_found(),
    };
    json_ok(payload)
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(
            json!({ "success": false, "message": "not found" }).to_string(),
        )))
        .unwrap()
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(
            json!({ "success": false, "message": message }).to_string(),
        )))
        .unwrap()
}

fn internal_error(message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(
            json!({ "success": false, "message": message }).to_string(),
        )))
        .unwrap()
}

fn json_ok(value: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

/// Admin surface is localhost-bound, so any `localhost`/`127.0.0.1` origin
/// (any port, for a local dashboard dev server) is allowed; anything else is
/// denied. Grounded in the teacher's `rpc::check_cors_origin`.
fn check_cors_origin(request_origin: Option<&str>) -> Option<String> {
    let origin = request_origin?;
    for allowed in ["http://localhost", "http://127.0.0.1"] {
        if origin.starts_with(allowed) {
            let suffix = &origin[allowed.len()..];
            if suffix.is_empty() || suffix.starts_with(':') {
                return Some(origin.to_string());
            }
        }
    }
    None
}

fn cors_response(mut response: Response<Full<Bytes>>, allowed_origin: Option<&str>) -> Response<Full<Bytes>> {
    let headers = response.headers_mut();
    if let Some(origin) = allowed_origin {
        headers.insert("Access-Control-Allow-Origin", origin.parse().unwrap());
        headers.insert(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS".parse().unwrap(),
        );
        headers.insert("Access-Control-Allow-Headers", "Content-Type".parse().unwrap());
        headers.insert("Vary", "Origin".parse().unwrap());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_allows_localhost_any_port() {
        assert_eq!(
            check_cors_origin(Some("http://localhost:5173")),
            Some("http://localhost:5173".to_string())
        );
    }

    #[test]
    fn cors_denies_other_origins() {
        assert_eq!(check_cors_origin(Some("http://evil.example")), None);
    }

    #[test]
    fn cors_denies_missing_origin() {
        assert_eq!(check_cors_origin(None), None);
    }
}
