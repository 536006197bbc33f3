//! Runtime configuration, resolved once at startup and read-only afterwards.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

/// Flush threshold applied when `--max-strokes-per-line` is left at zero.
pub const DEFAULT_MAX_STROKES_PER_LINE: usize = 2000;

const CA_BUNDLE_FILE: &str = "ca.crt";
const TOKEN_FILE: &str = "token";

/// Audited exec gateway and validating admission webhook.
#[derive(Parser, Debug)]
#[command(name = "rexec-gateway")]
#[command(about = "Audited exec gateway and admission webhook for Kubernetes")]
pub struct Args {
    /// Log every keystroke of TTY sessions to the audit stream
    #[arg(long)]
    pub audit_trace: bool,

    /// Verbose system logging
    #[arg(long)]
    pub sys_debug: bool,

    /// Username allowed to bypass the exec admission check (repeatable)
    #[arg(long = "by-pass-user")]
    pub bypass_users: Vec<String>,

    /// Shared key between the gateway and the validating webhook; a fresh
    /// UUID is generated when empty
    #[arg(long = "by-pass-shared-key", default_value = "")]
    pub shared_key: String,

    /// Keystrokes held per logical line before a forced audit flush
    #[arg(long, default_value_t = 0)]
    pub max_strokes_per_line: usize,

    /// Address the TLS listener binds to
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// Server certificate presented to callers
    #[arg(long, default_value = "/etc/pki/rexec/tls.crt")]
    pub tls_cert: PathBuf,

    /// Private key for the server certificate
    #[arg(long, default_value = "/etc/pki/rexec/tls.key")]
    pub tls_key: PathBuf,

    /// Upstream Kubernetes API endpoint
    #[arg(long, default_value = "kubernetes.default.svc.cluster.local:443")]
    pub upstream_addr: String,

    /// Directory holding the service account token and CA bundle
    #[arg(long, default_value = "/var/run/secrets/kubernetes.io/serviceaccount")]
    pub service_account_dir: PathBuf,

    /// Directory where per-session forwarder sockets are created
    #[arg(long, default_value = "/")]
    pub socket_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub upstream_addr: String,
    pub socket_dir: PathBuf,
    /// Service account bearer token used for impersonated upstream calls.
    pub token: String,
    /// PEM bundle trusted when dialing the upstream API.
    pub ca_bundle: Vec<u8>,
    /// The secret-sauce value proving a request traversed the gateway.
    pub shared_secret: String,
    pub bypass_users: Vec<String>,
    pub max_strokes_per_line: usize,
    pub audit_trace: bool,
    pub sys_debug: bool,
}

impl Config {
    /// Resolve flags into a runnable configuration. Missing service account
    /// files and a malformed shared key are startup-fatal.
    pub fn resolve(args: Args) -> Result<Config> {
        let ca_path = args.service_account_dir.join(CA_BUNDLE_FILE);
        let ca_bundle = fs::read(&ca_path)
            .with_context(|| format!("reading CA bundle at {}", ca_path.display()))?;

        let token_path = args.service_account_dir.join(TOKEN_FILE);
        let token = fs::read_to_string(&token_path)
            .with_context(|| format!("reading service account token at {}", token_path.display()))?
            .trim()
            .to_string();

        let shared_secret = if args.shared_key.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            Uuid::parse_str(&args.shared_key)
                .context("shared key must be a valid UUID")?
                .to_string()
        };

        let max_strokes_per_line = if args.max_strokes_per_line == 0 {
            DEFAULT_MAX_STROKES_PER_LINE
        } else {
            args.max_strokes_per_line
        };

        Ok(Config {
            listen_addr: args.listen_addr,
            tls_cert_path: args.tls_cert,
            tls_key_path: args.tls_key,
            upstream_addr: args.upstream_addr,
            socket_dir: args.socket_dir,
            token,
            ca_bundle,
            shared_secret,
            bypass_users: args.bypass_users,
            max_strokes_per_line,
            audit_trace: args.audit_trace,
            sys_debug: args.sys_debug,
        })
    }
}
