//! The session dispatcher.
//!
//! A session is one browser executor attached to the gateway: commands go
//! out over its SSE stream, results come back over the POST backchannel.
//! Sessions are short-lived, reaped after `sessionTtlMs` of silence, and
//! per-run result queues are strict FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use waygate_core::{ExecutionEvent, RunId, SessionId};
use waygate_crypto::KeyPair;

use crate::error::{GatewayError, GatewayResult};

/// Attach tokens expire five minutes after session creation.
pub const ATTACH_TOKEN_TTL: Duration = Duration::from_secs(300);

/// A command pushed to the browser executor over SSE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionCommand {
    /// Execute a capsule; all URLs are gateway-relative.
    #[serde(rename_all = "camelCase")]
    Capsule {
        /// URL of `capsule.json`.
        manifest_url: String,
        /// URL of the code layer ZIP.
        code_url: String,
        /// URLs of the mount layer ZIPs, in manifest order.
        layer_urls: Vec<String>,
        /// Run to report results under.
        run_id: RunId,
    },
    /// Best-effort cancellation of a run.
    #[serde(rename_all = "camelCase")]
    Cancel {
        /// The run to cancel.
        run_id: RunId,
    },
    /// The gateway is closing this session.
    #[serde(rename_all = "camelCase")]
    Shutdown {
        /// How long the executor has to wind down.
        grace_period_ms: u64,
    },
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Attached,
    Idle,
    Running,
    Closed,
}

struct Session {
    state: SessionState,
    browser_attached: bool,
    last_seen: Instant,
    tx: Option<mpsc::UnboundedSender<SessionCommand>>,
    results: HashMap<RunId, VecDeque<ExecutionEvent>>,
    active_run: Option<RunId>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::New,
            browser_attached: false,
            last_seen: Instant::now(),
            tx: None,
            results: HashMap::new(),
            active_run: None,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Routes tool calls to attached browser executors and collects their
/// results.
pub struct SessionDispatcher {
    sessions: DashMap<SessionId, Session>,
    runs: DashMap<RunId, SessionId>,
    keypair: Arc<KeyPair>,
    ttl: Duration,
}

impl SessionDispatcher {
    /// Create a dispatcher; tokens are signed with the gateway keypair.
    #[must_use]
    pub fn new(keypair: Arc<KeyPair>, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            runs: DashMap::new(),
            keypair,
            ttl,
        }
    }

    /// Create a session and its signed, expiring attach token.
    #[must_use]
    pub fn create_session(&self) -> (SessionId, String) {
        let id = SessionId::new();
        self.sessions.insert(id, Session::new());
        let token = self.mint_token(&id);
        info!(session = %id, "session created");
        (id, token)
    }

    fn mint_token(&self, id: &SessionId) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_add(ATTACH_TOKEN_TTL.as_secs());
        let payload = serde_json::json!({ "sid": id, "exp": exp }).to_string();
        let signature = self.keypair.sign(payload.as_bytes());
        format!(
            "{}.{}",
            B64URL.encode(payload.as_bytes()),
            B64URL.encode(signature)
        )
    }

    fn verify_token(&self, id: &SessionId, token: &str) -> GatewayResult<()> {
        let mut parts = token.split('.');
        let (Some(payload), Some(signature), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(GatewayError::InvalidToken("expected payload.signature".into()));
        };
        let payload_bytes = B64URL
            .decode(payload)
            .map_err(|_| GatewayError::InvalidToken("payload is not base64url".into()))?;
        let signature = B64URL
            .decode(signature)
            .map_err(|_| GatewayError::InvalidToken("signature is not base64url".into()))?;
        self.keypair
            .verify(&payload_bytes, &signature)
            .map_err(|_| GatewayError::InvalidToken("signature mismatch".into()))?;

        let claims: serde_json::Value = serde_json::from_slice(&payload_bytes)
            .map_err(|_| GatewayError::InvalidToken("payload is not JSON".into()))?;
        let sid = claims
            .get("sid")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if sid != id.to_string() {
            return Err(GatewayError::InvalidToken("token is for another session".into()));
        }
        let exp = claims.get("exp").and_then(serde_json::Value::as_u64).unwrap_or(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if exp < now {
            return Err(GatewayError::InvalidToken("token expired".into()));
        }
        Ok(())
    }

    /// Attach a browser to a session: validate the token and hand back the
    /// command receiver that feeds the SSE stream.
    ///
    /// # Errors
    ///
    /// Unknown session or invalid token.
    pub fn attach(
        &self,
        id: &SessionId,
        token: &str,
    ) -> GatewayResult<mpsc::UnboundedReceiver<SessionCommand>> {
        self.verify_token(id, token)?;
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownSession(id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        session.tx = Some(tx);
        session.browser_attached = true;
        session.state = SessionState::Attached;
        session.touch();
        info!(session = %id, "browser attached");
        Ok(rx)
    }

    /// Mark a browser gone (SSE stream dropped).
    pub fn detach(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.browser_attached = false;
            session.tx = None;
            if session.state != SessionState::Closed {
                session.state = SessionState::Idle;
            }
            debug!(session = %id, "browser detached");
        }
    }

    /// Pick any session with a live attached executor.
    #[must_use]
    pub fn pick_attached(&self) -> Option<SessionId> {
        self.sessions.iter().find_map(|entry| {
            let session = entry.value();
            let live = session.browser_attached
                && session.state != SessionState::Closed
                && session.tx.as_ref().is_some_and(|tx| !tx.is_closed());
            live.then(|| *entry.key())
        })
    }

    /// Push a command onto a session's SSE stream.
    ///
    /// # Errors
    ///
    /// Unknown session, or no attached executor.
    pub fn send_command(&self, id: &SessionId, command: SessionCommand) -> GatewayResult<()> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownSession(id.to_string()))?;
        let tx = session
            .tx
            .as_ref()
            .ok_or_else(|| GatewayError::NotAttached(id.to_string()))?
            .clone();

        if let SessionCommand::Capsule { run_id, .. } = &command {
            self.runs.insert(*run_id, *id);
            session.active_run = Some(*run_id);
            session.state = SessionState::Running;
        }
        tx.send(command)
            .map_err(|_| GatewayError::NotAttached(id.to_string()))?;
        session.touch();
        Ok(())
    }

    /// Enqueue a backchannel event for a run (per-run FIFO).
    ///
    /// # Errors
    ///
    /// Unknown session.
    pub fn add_result(
        &self,
        id: &SessionId,
        run_id: RunId,
        event: ExecutionEvent,
    ) -> GatewayResult<()> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownSession(id.to_string()))?;
        session.touch();
        let terminal = event.is_terminal();
        session.results.entry(run_id).or_default().push_back(event);
        if terminal {
            if session.active_run == Some(run_id) {
                session.active_run = None;
            }
            if session.state == SessionState::Running {
                session.state = SessionState::Idle;
            }
        }
        Ok(())
    }

    /// Drain the queued events for a run, in arrival order.
    #[must_use]
    pub fn take_results(&self, run_id: &RunId) -> Vec<ExecutionEvent> {
        let Some(sid) = self.runs.get(run_id).map(|e| *e.value()) else {
            return Vec::new();
        };
        let Some(mut session) = self.sessions.get_mut(&sid) else {
            return Vec::new();
        };
        session
            .results
            .get_mut(run_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drop a run's queue and its routing entry.
    pub fn clear_results(&self, run_id: &RunId) {
        if let Some((_, sid)) = self.runs.remove(run_id) {
            if let Some(mut session) = self.sessions.get_mut(&sid) {
                session.results.remove(run_id);
            }
        }
    }

    /// Best-effort cancel for a run still routed to a session.
    pub fn cancel_run(&self, run_id: &RunId) {
        if let Some(sid) = self.runs.get(run_id).map(|e| *e.value()) {
            let _ = self.send_command(&sid, SessionCommand::Cancel { run_id: *run_id });
        }
    }

    /// Close sessions idle beyond the TTL. Running runs get a best-effort
    /// cancel, attached browsers a shutdown command.
    pub fn reap_idle(&self) {
        let mut expired = Vec::new();
        for entry in &self.sessions {
            if entry.value().last_seen.elapsed() >= self.ttl {
                expired.push(*entry.key());
            }
        }
        for id in expired {
            self.close(&id);
        }
    }

    /// Close one session.
    pub fn close(&self, id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            if let Some(run_id) = session.active_run.take() {
                if let Some(tx) = session.tx.as_ref() {
                    let _ = tx.send(SessionCommand::Cancel { run_id });
                }
                self.runs.remove(&run_id);
            }
            if let Some(tx) = session.tx.take() {
                let _ = tx.send(SessionCommand::Shutdown {
                    grace_period_ms: 1_000,
                });
            }
            session.state = SessionState::Closed;
            session.browser_attached = false;
        }
        self.sessions.remove(id);
        warn!(session = %id, "session closed");
    }

    /// Close every session (server shutdown).
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for SessionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDispatcher")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
