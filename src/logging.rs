//! Tracing bootstrap and audit event emission.
//!
//! All output is structured JSON with a timestamp, and every line carries a
//! `facility` field: system events go through the `sys_*` macros below,
//! which stamp `facility = "sys"`, while audit records are tracing events
//! on the dedicated `audit` target stamped `facility = "audit"`. The two
//! verbosity switches map to filter directives: `--sys-debug` lifts the
//! crate's own target from `error` to `debug`, `--audit-trace` lifts the
//! `audit` target from `info` to `trace` (which is also what enables
//! per-keystroke records).

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// `tracing::error!` with the system facility stamped on the event.
#[macro_export]
macro_rules! sys_error {
    ($($arg:tt)*) => { ::tracing::error!(facility = "sys", $($arg)*) };
}

/// `tracing::info!` with the system facility stamped on the event.
#[macro_export]
macro_rules! sys_info {
    ($($arg:tt)*) => { ::tracing::info!(facility = "sys", $($arg)*) };
}

/// `tracing::debug!` with the system facility stamped on the event.
#[macro_export]
macro_rules! sys_debug {
    ($($arg:tt)*) => { ::tracing::debug!(facility = "sys", $($arg)*) };
}

/// Install the global JSON subscriber.
pub fn setup(sys_debug: bool, audit_trace: bool) -> Result<()> {
    let sys_level = if sys_debug { "debug" } else { "error" };
    let audit_level = if audit_trace { "trace" } else { "info" };
    let filter = EnvFilter::new(format!(
        "error,rexec_gateway={sys_level},audit={audit_level}"
    ));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
        .context("installing tracing subscriber")?;
    Ok(())
}

/// Emit an audit record for a reconstructed or initial command.
pub fn audit_command(user: &str, session: &str, command: &str) {
    tracing::info!(
        target: "audit",
        facility = "audit",
        user,
        session,
        command,
        ""
    );
}

/// Emit a per-keystroke audit record. Only visible at full trace.
pub fn audit_stroke(user: &str, session: &str, stroke: &str) {
    tracing::trace!(
        target: "audit",
        facility = "audit",
        user,
        session,
        stroke,
        ""
    );
}
