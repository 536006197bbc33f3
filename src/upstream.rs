//! TLS client plumbing for the upstream orchestrator API.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// A dialable upstream API endpoint with its trusted root pool.
pub struct Upstream {
    addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("addr", &self.addr)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl Upstream {
    /// Build the connector from a PEM bundle of trusted roots.
    pub fn new(addr: &str, ca_bundle: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let certs = rustls_pemfile::certs(&mut &*ca_bundle)
            .collect::<Result<Vec<_>, _>>()
            .context("parsing upstream CA bundle")?;
        if certs.is_empty() {
            anyhow::bail!("upstream CA bundle holds no certificates");
        }
        for cert in certs {
            roots.add(cert).context("adding upstream CA certificate")?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let server_name = ServerName::try_from(host.to_string())
            .context("upstream address is not a valid server name")?;

        Ok(Self {
            addr: addr.to_string(),
            server_name,
            connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// The `host:port` form, also used as the Host header of proxied calls.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Open a fresh TLS connection to the upstream API.
    pub async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to upstream at {}", self.addr))?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .context("upstream TLS handshake")?;
        Ok(tls)
    }
}
