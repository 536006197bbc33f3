//! Router assembly and the TLS listener.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Keystroke;
use crate::config::Config;
use crate::proxy;
use crate::session::SessionRegistry;
use crate::upstream::Upstream;
use crate::webhook;
use crate::{sys_debug, sys_error, sys_info};

/// Fixed discovery document for the custom API group, so the aggregation
/// layer upstream accepts the group without real resources behind it.
pub const DISCOVERY_DOCUMENT: &str = r#"{
  "kind": "APIResourceList",
  "apiVersion": "v1",
  "groupVersion": "audit.rexec.internal/v1beta1",
  "resources": []
}"#;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub upstream: Arc<Upstream>,
    pub strokes: mpsc::UnboundedSender<Keystroke>,
    pub shutdown: CancellationToken,
}

/// Build the gateway router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/apis/audit.rexec.internal/v1beta1", get(discovery))
        .route(
            "/apis/audit.rexec.internal/v1beta1/namespaces/{namespace}/pods/{pod}/exec",
            any(proxy::exec_handler),
        )
        .route("/validate-exec", post(webhook::validate_exec))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn discovery() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        DISCOVERY_DOCUMENT,
    )
}

async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// Serve the router over TLS until cancelled.
///
/// Connections are served one hyper task each with upgrades enabled, which
/// the exec proxy relies on to bridge WebSocket streams.
pub async fn run(state: AppState, cancel: CancellationToken) -> Result<()> {
    let tls_config =
        load_server_tls_config(&state.config.tls_cert_path, &state.config.tls_key_path).await?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .context("binding gateway listener")?;
    sys_info!(addr = %state.config.listen_addr, "rexec gateway listening");

    let app = build_router(state);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                sys_info!("gateway shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        sys_error!(error = %err, "failed to accept connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            sys_debug!(error = %err, %peer_addr, "tls handshake failed");
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(app);
                    let connection = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .with_upgrades();
                    if let Err(err) = connection.await {
                        sys_debug!(error = %err, %peer_addr, "connection error");
                    }
                });
            }
        }
    }
}

/// Load the server certificate and key.
async fn load_server_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_file = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("reading server certificate at {}", cert_path.display()))?;
    let key_file = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("reading server key at {}", key_path.display()))?;

    let certs: Vec<_> = certs(&mut cert_file.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("parsing server certificate")?;

    let key = private_key(&mut key_file.as_slice())
        .context("parsing server private key")?
        .context("no private key found")?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building server TLS config")
}
