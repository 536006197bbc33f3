//! Shared scaffolding for gateway integration tests: self-signed upstream
//! certificates, ready-made configs, and a TLS test upstream.

// not every test binary uses every helper
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rexec_gateway::aggregator::Keystroke;
use rexec_gateway::config::Config;
use rexec_gateway::server::AppState;
use rexec_gateway::session::SessionRegistry;
use rexec_gateway::upstream::Upstream;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Self-signed certificate for `localhost` / `127.0.0.1`, used both as the
/// test upstream's identity and as the gateway's trusted CA bundle.
pub fn generate_cert() -> TestCert {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".to_string().try_into().unwrap()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    let cert = params.self_signed(&key_pair).unwrap();
    TestCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn test_config(cert: &TestCert, upstream_addr: &str, socket_dir: PathBuf) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        tls_cert_path: PathBuf::from("/nonexistent/tls.crt"),
        tls_key_path: PathBuf::from("/nonexistent/tls.key"),
        upstream_addr: upstream_addr.to_string(),
        socket_dir,
        token: "test-service-account-token".to_string(),
        ca_bundle: cert.cert_pem.clone().into_bytes(),
        shared_secret: "the-right-sauce".to_string(),
        bypass_users: vec!["lauren".to_string()],
        max_strokes_per_line: 2000,
        audit_trace: true,
        sys_debug: false,
    }
}

/// Build an `AppState` around the given config, returning the receiving end
/// of the keystroke channel so tests can observe intercepted stdin.
pub fn test_state(config: Config) -> (AppState, mpsc::UnboundedReceiver<Keystroke>) {
    let config = Arc::new(config);
    let upstream = Arc::new(Upstream::new(&config.upstream_addr, &config.ca_bundle).unwrap());
    let (strokes_tx, strokes_rx) = mpsc::unbounded_channel();
    let state = AppState {
        config,
        registry: Arc::new(SessionRegistry::new()),
        upstream,
        strokes: strokes_tx,
        shutdown: CancellationToken::new(),
    };
    (state, strokes_rx)
}

fn server_tls_config(cert: &TestCert) -> ServerConfig {
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut cert.key_pem.as_bytes())
        .unwrap()
        .unwrap();
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap()
}

/// Spawn a TLS-terminated HTTP upstream serving `app` on an ephemeral port.
pub async fn spawn_tls_upstream(cert: &TestCert, app: Router) -> (u16, CancellationToken) {
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(cert)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = server_cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        let Ok(tls_stream) = acceptor.accept(stream).await else {
                            return;
                        };
                        let service = TowerToHyperService::new(app);
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .with_upgrades()
                            .await;
                    });
                }
            }
        }
    });

    (port, cancel)
}

/// Spawn a TLS upstream that simply echoes every byte back, for exercising
/// the raw splice path.
pub async fn spawn_tls_echo_upstream(cert: &TestCert) -> (u16, CancellationToken) {
    let acceptor = TlsAcceptor::from(Arc::new(server_tls_config(cert)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = server_cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let Ok(tls_stream) = acceptor.accept(stream).await else {
                            return;
                        };
                        let (mut read_half, mut write_half) = tokio::io::split(tls_stream);
                        let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
                    });
                }
            }
        }
    });

    (port, cancel)
}

/// Encode a masked binary WebSocket frame the way a browser or kubectl
/// WebSocket client would.
pub fn encode_masked_binary_frame(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 125);
    let key = [0x5au8, 0xa5, 0x3c, 0xc3];
    let mut out = vec![0x82, 0x80 | payload.len() as u8];
    out.extend_from_slice(&key);
    out.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % 4]),
    );
    out
}
