//! Per-connection session state machine and the registry of live sessions.
//!
//! ```text
//! Pending → Authenticating → Connecting → Relaying → Closing → Closed
//!                  │              │
//!                  └──────────────┴──→ Rejected
//! ```
//!
//! Every transition not drawn above is refused, so a session is single-use.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};
use vgate_core::{GateError, GateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Authenticating,
    Connecting,
    Relaying,
    Closing,
    Closed,
    Rejected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Authenticating)
                | (Authenticating, Connecting)
                | (Authenticating, Rejected)
                | (Connecting, Relaying)
                | (Connecting, Rejected)
                | (Relaying, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// One accepted WebSocket connection.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub remote: SocketAddr,
    pub target_id: Option<String>,
    pub started_at: Instant,
    state: SessionState,
}

impl Session {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            id: generate_session_id(),
            remote,
            target_id: None,
            started_at: Instant::now(),
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn advance(&mut self, next: SessionState) -> GateResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(GateError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(session_id = %self.id, from = %self.state, to = %next, "session state");
        self.state = next;
        Ok(())
    }

    /// Record the target the session was authorized for.
    pub fn bind(&mut self, target_id: &str) {
        self.target_id = Some(target_id.to_string());
    }
}

/// Snapshot of a live session for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub target_id: Option<String>,
    pub remote: String,
    pub state: SessionState,
    pub age_secs: u64,
}

struct Tracked {
    remote: SocketAddr,
    target_id: Option<String>,
    state: SessionState,
    started_at: Instant,
}

/// Registry of sessions that have not reached a terminal state.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Tracked>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the entry for `session`; terminal sessions are removed.
    pub async fn update(&self, session: &Session) {
        let mut sessions = self.sessions.write().await;
        if session.state().is_terminal() {
            if sessions.remove(&session.id).is_some() {
                info!(
                    session_id = %session.id,
                    state = %session.state(),
                    active = sessions.len(),
                    "session finished"
                );
            }
            return;
        }
        sessions.insert(
            session.id.clone(),
            Tracked {
                remote: session.remote,
                target_id: session.target_id.clone(),
                state: session.state(),
                started_at: session.started_at,
            },
        );
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: id.clone(),
                target_id: s.target_id.clone(),
                remote: s.remote.to_string(),
                state: s.state,
                age_secs: s.started_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Generate a random session ID (hex-encoded, 8 bytes = 16 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}
