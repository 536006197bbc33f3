//! Per-session local forwarder.
//!
//! Each TTY exec session gets its own unix socket listener. The reverse
//! proxy dials that socket; every accepted connection is spliced to a fresh
//! TLS connection to the upstream API, with the client-to-upstream half
//! wrapped in the keystroke interceptor. Cancelling the session token stops
//! the accept loop, removes the socket file, and drops the session record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Keystroke;
use crate::interceptor::AuditedWriter;
use crate::logging;
use crate::session::SessionRegistry;
use crate::upstream::Upstream;
use crate::{sys_debug, sys_error};

/// Filesystem location of a session's forwarder socket.
pub fn socket_path(socket_dir: &Path, session_id: &str) -> PathBuf {
    socket_dir.join(session_id)
}

/// Run one session's forwarder until `cancel` fires.
///
/// Readiness is signalled through the registry once the listener exists; a
/// bind failure logs and returns without signalling, leaving the handler to
/// time out.
pub async fn run(
    cancel: CancellationToken,
    session_id: String,
    registry: Arc<SessionRegistry>,
    upstream: Arc<Upstream>,
    strokes: UnboundedSender<Keystroke>,
    socket_dir: PathBuf,
    full_trace: bool,
) {
    let path = socket_path(&socket_dir, &session_id);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            sys_error!(
                session = %session_id,
                path = %path.display(),
                error = %err,
                "failed to bind session socket"
            );
            return;
        }
    };
    sys_debug!(
        session = %session_id,
        path = %path.display(),
        "session forwarder listening"
    );
    registry.mark_ready(&session_id);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let client = match accepted {
                    Ok((client, _)) => client,
                    Err(err) => {
                        sys_error!(session = %session_id, error = %err, "failed to accept session connection");
                        continue;
                    }
                };
                tokio::spawn(splice(
                    client,
                    session_id.clone(),
                    registry.clone(),
                    upstream.clone(),
                    strokes.clone(),
                    full_trace,
                ));
            }
        }
    }

    sys_debug!(session = %session_id, path = %path.display(), "stopping session forwarder");
    drop(listener);
    if let Err(err) = std::fs::remove_file(&path) {
        sys_debug!(
            session = %session_id,
            path = %path.display(),
            error = %err,
            "failed to remove session socket"
        );
    }
    if let Some(pending) = registry.remove(&session_id) {
        // keystrokes that never saw a carriage return still get audited
        logging::audit_command(&pending.user, &pending.session, &pending.command);
    }
}

/// Splice one accepted client against a fresh upstream connection.
async fn splice(
    client: UnixStream,
    session_id: String,
    registry: Arc<SessionRegistry>,
    upstream: Arc<Upstream>,
    strokes: UnboundedSender<Keystroke>,
    full_trace: bool,
) {
    let target = match upstream.connect().await {
        Ok(target) => target,
        Err(err) => {
            // dropping the client closes it; other sessions are unaffected
            sys_error!(session = %session_id, error = %err, "failed to connect to upstream");
            return;
        }
    };

    let (mut client_read, mut client_write) = client.into_split();
    let (mut target_read, target_write) = tokio::io::split(target);
    let mut audited = AuditedWriter::new(target_write, session_id.clone(), registry, strokes, full_trace);

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut audited) => {
            if let Err(err) = result {
                sys_debug!(session = %session_id, error = %err, "client to upstream copy ended");
            }
        }
        result = tokio::io::copy(&mut target_read, &mut client_write) => {
            if let Err(err) = result {
                sys_debug!(session = %session_id, error = %err, "upstream to client copy ended");
            }
        }
    }
    // either half finishing tears the whole splice down
}
