//! Enrollment channel (spec §4.13): plaintext, a single RPC. A prospective
//! client presents a CSR and the operator-issued registration token; on
//! success it receives a client certificate signed by the server's CA plus
//! the CA certificate it needs to trust the control channel's server leaf.
//!
//! Deliberately has no side effects on the client registry (spec §4.4/§4.5):
//! a record is only created once the signed certificate is actually used to
//! open the mTLS control channel.

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
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::ca::CertificateAuthority;
use crate::error::FatalStartupError;

#[derive(Deserialize)]
struct EnrollRequest {
    client_id: String,
    csr_pem: String,
    registration_token: String,
}

struct State {
    ca: Arc<CertificateAuthority>,
    registration_token: String,
}

pub async fn serve(
    addr: SocketAddr,
    ca: Arc<CertificateAuthority>,
    registration_token: String,
) -> Result<(), FatalStartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| FatalStartupError::Bind {
            surface: "enrollment",
            addr: addr.to_string(),
            source,
        })?;
    info!(%addr, "enrollment listener bound");

    let state = Arc::new(State {
        ca,
        registration_token,
    });

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "enrollment accept failed");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, state.clone(), peer));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %err, "enrollment connection error");
            }
        });
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<State>,
    _peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::from("method not allowed")))
            .unwrap());
    }

    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read enrollment request body");
            return Ok(bad_request("failed to read request body"));
        }
    };

    let request: EnrollRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return Ok(bad_request(&format!("malformed enrollment request: {e}"))),
    };

    if state.registration_token.is_empty() || request.registration_token != state.registration_token
    {
        warn!(client_id = %request.client_id, "enrollment rejected: invalid registration token");
        return Ok(json_ok(json!({
            "success": false,
            "message": "invalid or expired registration token",
        })));
    }

    match state.ca.sign_csr(&request.csr_pem, &request.client_id) {
        Ok(signed) => {
            info!(client_id = %request.client_id, "enrollment issued client certificate");
            Ok(json_ok(json!({
                "success": true,
                "message": "enrolled",
                "client_cert_pem": signed.client_cert_pem,
                "ca_cert_pem": signed.ca_cert_pem,
            })))
        }
        Err(e) => {
            warn!(client_id = %request.client_id, error = %e, "enrollment CSR signing failed");
            Ok(json_ok(json!({
                "success": false,
                "message": e.to_string(),
            })))
        }
    }
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

fn json_ok(value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}
