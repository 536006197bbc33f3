//! Keystroke aggregator: turns raw stdin bytes back into command lines.
//!
//! A single consumer drains a process-wide channel of `{session, bytes}`
//! items pushed by the per-session interceptors. Because there is exactly
//! one consumer, buffer mutations for a given session are serialized by
//! channel order; the registry lock is only held for the span of a single
//! byte's decision.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::logging;
use crate::session::{CommandRecord, SessionRegistry};
use crate::sys_debug;

/// Raw stdin bytes observed for one session.
#[derive(Debug)]
pub struct Keystroke {
    pub session_id: String,
    pub bytes: Vec<u8>,
}

/// Apply one keystroke batch to the session's edit buffer, returning any
/// command lines that became complete.
///
/// Byte semantics: NUL is ignored, BS/DEL drop the last buffered byte, CR
/// flushes the line, and any other byte flushes first when the buffer is
/// full, then appends.
pub fn apply_keystrokes(
    registry: &SessionRegistry,
    max_strokes: usize,
    stroke: &Keystroke,
) -> Vec<CommandRecord> {
    let id = &stroke.session_id;
    let mut records = Vec::new();
    for &byte in &stroke.bytes {
        match byte {
            0 => {}
            8 | 127 => registry.erase_last(id),
            13 => {
                if let Some(record) = registry.flush_line(id) {
                    records.push(record);
                }
            }
            _ => {
                if let Some(record) = registry.append_stroke(id, byte, max_strokes) {
                    records.push(record);
                }
            }
        }
    }
    records
}

/// Run the aggregator until the keystroke channel closes.
pub async fn run(
    mut strokes: mpsc::UnboundedReceiver<Keystroke>,
    registry: Arc<SessionRegistry>,
    max_strokes: usize,
) {
    sys_debug!("starting keystroke aggregator");
    while let Some(stroke) = strokes.recv().await {
        for record in apply_keystrokes(&registry, max_strokes, &stroke) {
            logging::audit_command(&record.user, &record.session, &record.command);
        }
    }
    sys_debug!("keystroke channel closed, stopping aggregator");
}
