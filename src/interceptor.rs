//! Write-side interception of the client-to-upstream byte stream.
//!
//! Wraps the upstream write half of a spliced TTY session. Every chunk is
//! forwarded untouched; afterwards the chunk feeds a frame reassembler.
//! The stream starts with the HTTP exec request head that the reverse proxy
//! writes before the connection upgrades, so framing only begins after the
//! head's terminating blank line; everything from there on is WebSocket
//! traffic. Binary frames carry the client's stdin, so their payload is
//! logged as a stroke and pushed onto the aggregator channel. Frames may
//! arrive split across writes; the reverse direction is never inspected.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncWrite;
use tokio::sync::mpsc::UnboundedSender;

use crate::aggregator::Keystroke;
use crate::frame::{self, OPCODE_BINARY};
use crate::logging;
use crate::session::SessionRegistry;
use crate::sys_debug;

/// Upper bound on buffered bytes while waiting for the rest of a frame.
const MAX_PENDING_BYTES: usize = 1 << 20;

pub struct AuditedWriter<W> {
    inner: W,
    session_id: String,
    registry: Arc<SessionRegistry>,
    strokes: UnboundedSender<Keystroke>,
    full_trace: bool,
    /// Set once the HTTP request head has been consumed and frames begin.
    upgraded: bool,
    pending: Vec<u8>,
}

impl<W> AuditedWriter<W> {
    pub fn new(
        inner: W,
        session_id: String,
        registry: Arc<SessionRegistry>,
        strokes: UnboundedSender<Keystroke>,
        full_trace: bool,
    ) -> Self {
        Self {
            inner,
            session_id,
            registry,
            strokes,
            full_trace,
            upgraded: false,
            pending: Vec::new(),
        }
    }

    /// Feed forwarded bytes into the reassembly buffer and drain every
    /// complete frame. Never fails: a malformed frame costs a diagnostic,
    /// not the write.
    fn observe(&mut self, written: &[u8]) {
        self.pending.extend_from_slice(written);

        if !self.upgraded {
            // the exec request head is not frame data; skip up to and
            // including its terminating blank line
            match blank_line_end(&self.pending) {
                Some(end) => {
                    self.pending.drain(..end);
                    self.upgraded = true;
                    sys_debug!(session = %self.session_id, "request head consumed, framing begins");
                }
                None => {
                    // keep only what could still complete the terminator
                    let consumed = self.pending.len().saturating_sub(3);
                    self.pending.drain(..consumed);
                    return;
                }
            }
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            sys_debug!(
                session = %self.session_id,
                pending = self.pending.len(),
                "dropping oversized partial frame buffer"
            );
            self.pending.clear();
            return;
        }

        loop {
            let total = match frame::frame_len(&self.pending) {
                Some(total) => total,
                None => break, // header still incomplete
            };
            if self.pending.len() < total {
                break; // rest of the frame is still in flight
            }
            let chunk: Vec<u8> = self.pending.drain(..total).collect();
            match frame::parse_frame(&chunk) {
                Ok(parsed) if parsed.opcode == OPCODE_BINARY => {
                    // keystroke reconstruction only runs at full trace
                    if self.full_trace {
                        self.record(parsed.payload);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    sys_debug!(
                        session = %self.session_id,
                        error = %err,
                        "failed to parse websocket frame"
                    );
                }
            }
        }
    }

    fn record(&self, payload: Vec<u8>) {
        let user = self.registry.user(&self.session_id).unwrap_or_default();
        let stroke = String::from_utf8_lossy(&payload).replace('\u{0}', "");
        logging::audit_stroke(&user, &self.session_id, &stroke);
        let _ = self.strokes.send(Keystroke {
            session_id: self.session_id.clone(),
            bytes: payload,
        });
    }
}

/// Offset just past the first `\r\n\r\n`, if one is present.
fn blank_line_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|start| start + 4)
}

impl<W: AsyncWrite + Unpin> AsyncWrite for AuditedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if written > 0 {
            this.observe(&buf[..written]);
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
