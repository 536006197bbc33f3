//! Process-wide registry of active TTY exec sessions.
//!
//! One record per session holds everything the rest of the gateway needs:
//! the invoking user, the line-edit buffer the keystroke aggregator builds,
//! and the readiness state of the session's local forwarder. A single lock
//! covers the whole record, so teardown is one removal and the three pieces
//! of state can never disagree about which sessions exist.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Notify;

/// How long the exec handler waits for a session's forwarder to come up.
const READY_DEADLINE: Duration = Duration::from_secs(5);

/// An audit-worthy reconstructed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub user: String,
    pub session: String,
    pub command: String,
}

struct Session {
    user: String,
    buffer: Vec<u8>,
    ready: bool,
    notify: Arc<Notify>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `user`.
    pub fn insert(&self, id: &str, user: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            id.to_string(),
            Session {
                user: user.to_string(),
                buffer: Vec::new(),
                ready: false,
                notify: Arc::new(Notify::new()),
            },
        );
    }

    pub fn user(&self, id: &str) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(id).map(|s| s.user.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(id)
    }

    /// Number of currently registered sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Mark the session's forwarder listener as accepting and wake the
    /// handler waiting on it. Returns false for unknown ids.
    pub fn mark_ready(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(id) {
            Some(session) => {
                session.ready = true;
                session.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Wait until the session's forwarder is accepting connections.
    ///
    /// Returns immediately when readiness was already signalled; fails after
    /// five seconds otherwise (including for ids that were never registered).
    pub async fn await_ready(&self, id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READY_DEADLINE;
        loop {
            let notify = {
                let sessions = self.sessions.lock().unwrap();
                match sessions.get(id) {
                    Some(session) if session.ready => return Ok(()),
                    Some(session) => Some(session.notify.clone()),
                    None => None,
                }
            };
            let woken = async {
                match notify {
                    // notify_one stores a permit, so a signal sent between
                    // dropping the lock and awaiting here is not lost
                    Some(notify) => notify.notified().await,
                    None => std::future::pending().await,
                }
            };
            if tokio::time::timeout_at(deadline, woken).await.is_err() {
                bail!("session {id} listener was not ready in time");
            }
        }
    }

    /// Remove the whole session record. If keystrokes were still buffered,
    /// the pending line is returned so the caller can emit it.
    pub fn remove(&self, id: &str) -> Option<CommandRecord> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.remove(id)?;
        if session.buffer.is_empty() {
            return None;
        }
        Some(CommandRecord {
            user: session.user,
            session: id.to_string(),
            command: String::from_utf8_lossy(&session.buffer).into_owned(),
        })
    }

    /// Drop the last buffered byte, if any (backspace / delete).
    pub fn erase_last(&self, id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            session.buffer.pop();
        }
    }

    /// Flush the buffered line as a command record (carriage return).
    pub fn flush_line(&self, id: &str) -> Option<CommandRecord> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id)?;
        let command = String::from_utf8_lossy(&session.buffer).into_owned();
        session.buffer.clear();
        Some(CommandRecord {
            user: session.user.clone(),
            session: id.to_string(),
            command,
        })
    }

    /// Append a printable byte. When the buffer is already at `max` the
    /// current line is flushed first, bounding memory per session.
    pub fn append_stroke(&self, id: &str, byte: u8, max: usize) -> Option<CommandRecord> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id)?;
        let mut flushed = None;
        if session.buffer.len() >= max {
            flushed = Some(CommandRecord {
                user: session.user.clone(),
                session: id.to_string(),
                command: String::from_utf8_lossy(&session.buffer).into_owned(),
            });
            session.buffer.clear();
        }
        session.buffer.push(byte);
        flushed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn await_ready_returns_fast_when_already_ready() {
        let registry = SessionRegistry::new();
        registry.insert("session-123", "alice");
        assert!(registry.mark_ready("session-123"));

        let start = Instant::now();
        registry.await_ready("session-123").await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn await_ready_times_out_for_unknown_session() {
        let registry = SessionRegistry::new();
        let start = tokio::time::Instant::now();
        let err = registry.await_ready("no-such-session").await.unwrap_err();
        assert!(err.to_string().contains("not ready in time"));
        assert!(start.elapsed() >= READY_DEADLINE);
    }

    #[tokio::test]
    async fn await_ready_wakes_on_signal() {
        let registry = Arc::new(SessionRegistry::new());
        registry.insert("s1", "bob");

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_ready("s1").await })
        };
        tokio::task::yield_now().await;
        assert!(registry.mark_ready("s1"));
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn remove_clears_everything_and_returns_pending_line() {
        let registry = SessionRegistry::new();
        registry.insert("s1", "carol");
        registry.append_stroke("s1", b'l', 2000);
        registry.append_stroke("s1", b's', 2000);

        let pending = registry.remove("s1").unwrap();
        assert_eq!(pending.user, "carol");
        assert_eq!(pending.command, "ls");
        assert!(!registry.contains("s1"));
        assert!(registry.user("s1").is_none());
        assert!(registry.remove("s1").is_none());
    }

    #[test]
    fn erase_last_on_empty_buffer_is_a_noop() {
        let registry = SessionRegistry::new();
        registry.insert("s1", "dave");
        registry.erase_last("s1");
        let record = registry.flush_line("s1").unwrap();
        assert_eq!(record.command, "");
    }

    #[test]
    fn unknown_session_strokes_are_dropped() {
        let registry = SessionRegistry::new();
        assert!(registry.append_stroke("ghost", b'x', 10).is_none());
        assert!(registry.flush_line("ghost").is_none());
        assert!(!registry.mark_ready("ghost"));
    }
}
