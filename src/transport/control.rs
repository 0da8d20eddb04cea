//! Control channel (spec §4.13): mutual TLS, every request authenticated
//! against the peer certificate's Common Name. Grounded in the teacher's
//! `network/transport/tls_tunnel.rs` TLS setup shape (ECDSA leaf certificate,
//! `TlsAcceptor::from(Arc::new(server_config))`), generalized to *require and
//! verify* a client certificate rather than skip verification the way that
//! file's self-signed, peer-ID-bound P2P design does — that design doesn't
//! carry spec §4.13's mTLS requirement.
//!
//! Wire format: each request and response is a big-endian `u32` length
//! prefix followed by that many bytes of JSON. A connection serves one
//! already-authenticated client for as many requests as it cares to send.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::ca::ServerCredentials;
use crate::error::FatalStartupError;
use crate::orchestrator::RoundOrchestrator;
use crate::registry::ClientRegistry;
use crate::types::PrivacyMode;

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Deserialize)]
#[serde(tag = "method")]
enum ControlRequest {
    RegisterClient {
        client_id: String,
    },
    Heartbeat {
        client_id: String,
    },
    FetchModel {
        client_id: String,
    },
    SubmitUpdate {
        client_id: String,
        privacy_mode: PrivacyMode,
        payload_hex: String,
    },
    SubmitShare {
        client_id: String,
        share_index: u32,
        total_shares: u32,
        data_hex: String,
    },
}

#[derive(Serialize, Default)]
struct ControlResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_round_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_hex: Option<String>,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    fn err(message: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            ..Default::default()
        }
    }
}

fn build_server_config(creds: &ServerCredentials) -> Result<ServerConfig, FatalStartupError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let server_certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut creds.server_cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| FatalStartupError::CaLoad(format!("parsing server certificate: {e}")))?;
    let server_key = rustls_pemfile::private_key(&mut creds.server_key_pem.as_bytes())
        .map_err(|e| FatalStartupError::CaLoad(format!("parsing server key: {e}")))?
        .ok_or_else(|| FatalStartupError::CaLoad("no private key found in server.key".to_string()))?;

    let ca_certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut creds.ca_cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| FatalStartupError::CaLoad(format!("parsing CA certificate: {e}")))?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| FatalStartupError::CaLoad(format!("adding CA root: {e}")))?;
    }

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| FatalStartupError::CaLoad(format!("building client verifier: {e}")))?;

    ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_certs, server_key)
        .map_err(|e| FatalStartupError::CaLoad(format!("building TLS server config: {e}")))
}

pub async fn serve(
    addr: SocketAddr,
    creds: ServerCredentials,
    registry: Arc<ClientRegistry>,
    orchestrator: Arc<RoundOrchestrator>,
) -> Result<(), FatalStartupError> {
    let server_config = build_server_config(&creds)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| FatalStartupError::Bind {
            surface: "control",
            addr: addr.to_string(),
            source,
        })?;
    info!(%addr, "control listener bound (mTLS)");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "control accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let registry = registry.clone();
        let orchestrator = orchestrator.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%peer, error = %e, "control TLS handshake failed");
                    return;
                }
            };

            let cn = match peer_common_name(&tls_stream) {
                Ok(cn) => cn,
                Err(e) => {
                    warn!(%peer, error = %e, "control connection rejected");
                    return;
                }
            };

            if let Err(e) = serve_connection(tls_stream, &cn, peer, &registry, &orchestrator).await {
                warn!(%peer, client_id = %cn, error = %e, "control connection closed with error");
            }
        });
    }
}

fn peer_common_name(
    stream: &tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
) -> Result<String, crate::error::TransportAuthError> {
    let (_io, conn) = stream.get_ref();
    let certs = conn
        .peer_certificates()
        .ok_or(crate::error::TransportAuthError::MissingCn)?;
    let leaf = certs
        .first()
        .ok_or(crate::error::TransportAuthError::MissingCn)?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|_| crate::error::TransportAuthError::MissingCn)?;
    parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or(crate::error::TransportAuthError::MissingCn)
}

async fn serve_connection(
    mut stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
    cn: &str,
    peer: SocketAddr,
    registry: &Arc<ClientRegistry>,
    orchestrator: &Arc<RoundOrchestrator>,
) -> std::io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await? {
            Some(bytes) => bytes,
            None => return Ok(()),
        };

        let response = match serde_json::from_slice::<ControlRequest>(&frame) {
            Ok(request) => dispatch(request, cn, peer, registry, orchestrator),
            Err(e) => ControlResponse::err(format!("malformed control request: {e}")),
        };

        let bytes = serde_json::to_vec(&response).expect("ControlResponse is always serializable");
        write_frame(&mut stream, &bytes).await?;
    }
}

fn dispatch(
    request: ControlRequest,
    cn: &str,
    peer: SocketAddr,
    registry: &Arc<ClientRegistry>,
    orchestrator: &Arc<RoundOrchestrator>,
) -> ControlResponse {
    let now = crate::util::now_unix();

    let declared_client_id = match &request {
        ControlRequest::RegisterClient { client_id }
        | ControlRequest::Heartbeat { client_id }
        | ControlRequest::FetchModel { client_id }
        | ControlRequest::SubmitUpdate { client_id, .. }
        | ControlRequest::SubmitShare { client_id, .. } => client_id.clone(),
    };

    if declared_client_id != cn {
        return ControlResponse::err(crate::error::TransportAuthError::CnMismatch {
            declared: declared_client_id,
            cn: cn.to_string(),
        });
    }

    match request {
        ControlRequest::RegisterClient { client_id } => {
            match registry.upsert(&client_id, &peer.ip().to_string(), "mtls", now) {
                Ok(()) => ControlResponse::ok("registered"),
                Err(e) => ControlResponse::err(e),
            }
        }
        ControlRequest::Heartbeat { client_id } => {
            match registry.heartbeat(&client_id, now) {
                Ok(true) => {
                    let new_round_available = orchestrator.consume_new_round_flag(&client_id);
                    ControlResponse {
                        success: true,
                        message: "heartbeat accepted".to_string(),
                        server_ts: Some(now),
                        new_round_available: Some(new_round_available),
                        model_hex: None,
                    }
                }
                Ok(false) => ControlResponse::err("client is not registered"),
                Err(e) => ControlResponse::err(e),
            }
        }
        ControlRequest::FetchModel { client_id } => match orchestrator.fetch_model(&client_id, now) {
            Ok(bytes) => ControlResponse {
                success: true,
                message: "model served".to_string(),
                server_ts: Some(now),
                new_round_available: None,
                model_hex: Some(hex::encode(bytes)),
            },
            Err(e) => ControlResponse::err(e.into_rpc_failure_message()),
        },
        ControlRequest::SubmitUpdate {
            client_id,
            privacy_mode,
            payload_hex,
        } => {
            let payload = match hex::decode(&payload_hex) {
                Ok(bytes) => bytes,
                Err(e) => return ControlResponse::err(format!("invalid payload_hex: {e}")),
            };
            match orchestrator.receive_update(&client_id, privacy_mode, &payload, now) {
                Ok(()) => ControlResponse::ok("update accepted"),
                Err(e) => ControlResponse::err(e.into_rpc_failure_message()),
            }
        }
        ControlRequest::SubmitShare {
            client_id,
            share_index,
            total_shares,
            data_hex,
        } => {
            let data = match hex::decode(&data_hex) {
                Ok(bytes) => bytes,
                Err(e) => return ControlResponse::err(format!("invalid data_hex: {e}")),
            };
            match orchestrator.receive_share(&client_id, share_index, total_shares, data, now) {
                Ok(()) => ControlResponse::ok("share accepted"),
                Err(e) => ControlResponse::err(e.into_rpc_failure_message()),
            }
        }
    }
}

async fn read_frame<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte cap"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Every `{Submit,Fetch,Share}Error` already converts to `RpcFailure`; the
/// control channel only needs the message half of that envelope.
trait IntoRpcFailureMessage {
    fn into_rpc_failure_message(self) -> String;
}

impl<T> IntoRpcFailureMessage for T
where
    T: Into<crate::error::RpcFailure>,
{
    fn into_rpc_failure_message(self) -> String {
        self.into().message
    }
}
