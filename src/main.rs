use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rexec_gateway::config::{Args, Config};
use rexec_gateway::server::AppState;
use rexec_gateway::session::SessionRegistry;
use rexec_gateway::upstream::Upstream;
use rexec_gateway::{aggregator, logging, server, sys_error, sys_info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup(args.sys_debug, args.audit_trace)?;
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Arc::new(Config::resolve(args)?);
    let registry = Arc::new(SessionRegistry::new());
    let upstream = Arc::new(
        Upstream::new(&config.upstream_addr, &config.ca_bundle)
            .context("building upstream connector")?,
    );

    let (strokes_tx, strokes_rx) = mpsc::unbounded_channel();
    let aggregator = tokio::spawn(aggregator::run(
        strokes_rx,
        registry.clone(),
        config.max_strokes_per_line,
    ));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let state = AppState {
        config,
        registry,
        upstream,
        strokes: strokes_tx.clone(),
        shutdown: cancel.clone(),
    };
    let result = server::run(state, cancel).await;

    // closing the keystroke channel stops the aggregator
    drop(strokes_tx);
    let _ = aggregator.await;
    result
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    sys_error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => sys_info!("received interrupt"),
            _ = sigterm.recv() => sys_info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}
