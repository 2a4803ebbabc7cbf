//! Session store
//!
//! Process-local mapping from session id to conversation state: the inbound
//! reassembly buffer, conversation history, outbound response chunks, and
//! generation status. The wire handler writes inbound state, the
//! orchestrator writes outbound state, and client polls read concurrently;
//! a map-level lock guards lookup/create/evict while each session carries
//! its own lock for compound operations.
//!
//! Nothing is persisted. Sessions die with the process or with the idle
//! sweeper, whichever comes first.

use crate::codec;
use crate::llm::ChatMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Generation state machine.
///
/// Advances monotonically `Idle -> ReceivingRequest -> Generating ->
/// (Complete | Error)` and resets to `ReceivingRequest` only when the next
/// turn's first chunk arrives after a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    ReceivingRequest,
    Generating,
    Complete,
    Error,
}

impl GenerationState {
    /// Single-letter form used in `cnt` replies
    pub fn status_char(self) -> char {
        match self {
            GenerationState::Complete => 'c',
            GenerationState::Error => 'e',
            _ => 'g',
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, GenerationState::Complete | GenerationState::Error)
    }
}

/// Result of recording one inbound chunk
#[derive(Debug)]
pub enum InboundOutcome {
    /// More chunks outstanding
    Pending,
    /// Final chunk arrived; the full envelope is assembled and the inbound
    /// buffer cleared. Returned exactly once per turn.
    Complete(Vec<u8>),
    /// Conflicting or unusable delivery; the session is now poisoned
    Error,
}

/// Result of a non-blocking outbound read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Chunk(String),
    NotYet,
    /// The turn is finished and the index lies past the last chunk
    End,
}

struct Session {
    inbound: HashMap<u32, String>,
    expected_total: Option<u32>,
    history: Vec<ChatMessage>,
    outbound: Vec<String>,
    state: GenerationState,
    last_touch: Instant,
    cancel: Option<watch::Sender<bool>>,
}

impl Session {
    fn new() -> Self {
        Self {
            inbound: HashMap::new(),
            expected_total: None,
            history: Vec::new(),
            outbound: Vec::new(),
            state: GenerationState::Idle,
            last_touch: Instant::now(),
            cancel: None,
        }
    }

    /// Begin a fresh turn: wipe both buffers, keep history
    fn reset_for_turn(&mut self) {
        self.inbound.clear();
        self.expected_total = None;
        self.outbound.clear();
        self.state = GenerationState::ReceivingRequest;
    }

    fn poison(&mut self) {
        self.inbound.clear();
        self.expected_total = None;
        self.state = GenerationState::Error;
    }

    fn signal_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

/// Concurrent mapping from session id to session state
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Lookup-or-create a session and refresh its last-touch stamp
    async fn touch(&self, sid: &str) -> Arc<Mutex<Session>> {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .entry(sid.to_string())
                .or_insert_with(|| {
                    debug!("Creating session {}", sid);
                    Arc::new(Mutex::new(Session::new()))
                })
                .clone()
        };
        entry.lock().await.last_touch = Instant::now();
        entry
    }

    async fn get(&self, sid: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().await.get(sid).cloned()
    }

    /// Record one inbound chunk, atomically with respect to concurrent
    /// reads of the same session.
    ///
    /// Duplicate deliveries with byte-equal payloads are idempotent; a
    /// payload mismatch or inconsistent total poisons the session.
    pub async fn record_inbound(
        &self,
        sid: &str,
        idx: u32,
        total: u32,
        payload: &str,
    ) -> InboundOutcome {
        if total == 0 || idx >= total {
            return InboundOutcome::Error;
        }

        let entry = self.touch(sid).await;
        let mut session = entry.lock().await;

        if session.state == GenerationState::Generating {
            // Almost certainly a retransmit of the turn already assembled
            debug!("Ignoring inbound chunk for {} mid-generation", sid);
            return InboundOutcome::Pending;
        }

        if session.state.is_terminal() || session.state == GenerationState::Idle {
            session.reset_for_turn();
        }

        match session.expected_total {
            None => session.expected_total = Some(total),
            Some(expected) if expected != total => {
                warn!(
                    "Session {}: total mismatch ({} vs {}), poisoning",
                    sid, expected, total
                );
                session.poison();
                return InboundOutcome::Error;
            }
            Some(_) => {}
        }

        if let Some(existing) = session.inbound.get(&idx) {
            if existing == payload {
                return InboundOutcome::Pending;
            }
            warn!("Session {}: chunk conflict at index {}, poisoning", sid, idx);
            session.poison();
            return InboundOutcome::Error;
        }

        session.inbound.insert(idx, payload.to_string());

        if session.inbound.len() as u32 == total {
            // All of [0, total) present exactly once; assemble in index order
            let Some(labels) = (0..total)
                .map(|i| session.inbound.remove(&i))
                .collect::<Option<Vec<String>>>()
            else {
                session.poison();
                return InboundOutcome::Error;
            };
            session.expected_total = None;

            match codec::join(&labels) {
                Ok(bytes) => InboundOutcome::Complete(bytes),
                Err(e) => {
                    warn!("Session {}: reassembly failed: {}", sid, e);
                    session.poison();
                    InboundOutcome::Error
                }
            }
        } else {
            InboundOutcome::Pending
        }
    }

    /// Transition to `Generating`, handing back the cancellation signal.
    ///
    /// Returns `None` when another generation is already active for the
    /// session, or when the session does not exist.
    pub async fn begin_generation(&self, sid: &str) -> Option<watch::Receiver<bool>> {
        let entry = self.get(sid).await?;
        let mut session = entry.lock().await;

        if session.state == GenerationState::Generating {
            return None;
        }

        let (tx, rx) = watch::channel(false);
        session.state = GenerationState::Generating;
        session.cancel = Some(tx);
        Some(rx)
    }

    /// Append one outbound chunk, returning its assigned index
    pub async fn append_outbound(&self, sid: &str, chunk: String) -> Result<u32, SessionError> {
        let entry = self
            .get(sid)
            .await
            .ok_or_else(|| SessionError::NotFound(sid.to_string()))?;
        let mut session = entry.lock().await;

        session.last_touch = Instant::now();
        session.outbound.push(chunk);
        Ok(session.outbound.len() as u32 - 1)
    }

    /// Non-blocking read of the outbound chunk at `idx`
    pub async fn read_outbound(&self, sid: &str, idx: u32) -> ReadOutcome {
        let Some(entry) = self.get(sid).await else {
            return ReadOutcome::NotYet;
        };
        let mut session = entry.lock().await;
        session.last_touch = Instant::now();

        if let Some(chunk) = session.outbound.get(idx as usize) {
            ReadOutcome::Chunk(chunk.clone())
        } else if session.state.is_terminal() {
            ReadOutcome::End
        } else {
            ReadOutcome::NotYet
        }
    }

    /// Produced-count and state letter for `cnt` replies
    pub async fn status(&self, sid: &str) -> (u32, char) {
        let Some(entry) = self.get(sid).await else {
            return (0, GenerationState::Idle.status_char());
        };
        let mut session = entry.lock().await;
        session.last_touch = Instant::now();
        (session.outbound.len() as u32, session.state.status_char())
    }

    /// Mark the active generation finished
    pub async fn finish_generation(&self, sid: &str, state: GenerationState) {
        debug_assert!(state.is_terminal());
        if let Some(entry) = self.get(sid).await {
            let mut session = entry.lock().await;
            session.state = state;
            session.cancel = None;
        }
    }

    /// Append one message to the conversation history
    pub async fn push_history(&self, sid: &str, message: ChatMessage) -> Result<(), SessionError> {
        self.extend_history(sid, vec![message]).await
    }

    /// Append several messages to the conversation history
    pub async fn extend_history(
        &self,
        sid: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(), SessionError> {
        let entry = self
            .get(sid)
            .await
            .ok_or_else(|| SessionError::NotFound(sid.to_string()))?;
        entry.lock().await.history.extend(messages);
        Ok(())
    }

    /// Snapshot of the conversation history
    pub async fn history(&self, sid: &str) -> Vec<ChatMessage> {
        match self.get(sid).await {
            Some(entry) => entry.lock().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Drop history and both buffers; the sid stays registered.
    ///
    /// An active generation is cancelled. Clearing an unknown or empty
    /// session is a no-op.
    pub async fn clear(&self, sid: &str) {
        if let Some(entry) = self.get(sid).await {
            let mut session = entry.lock().await;
            session.signal_cancel();
            session.history.clear();
            session.inbound.clear();
            session.expected_total = None;
            session.outbound.clear();
            session.state = GenerationState::Idle;
            session.last_touch = Instant::now();
            info!("Session {} cleared", sid);
        }
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict sessions idle longer than `idle_timeout`, cancelling any
    /// in-flight generation first.
    pub async fn sweep(&self, idle_timeout: Duration) {
        let entries: Vec<(String, Arc<Mutex<Session>>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(sid, entry)| (sid.clone(), entry.clone()))
                .collect()
        };

        let now = Instant::now();
        let mut expired = Vec::new();
        for (sid, entry) in entries {
            let mut session = entry.lock().await;
            if now.duration_since(session.last_touch) >= idle_timeout {
                session.signal_cancel();
                expired.push(sid);
            }
        }

        if !expired.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for sid in expired {
                info!("Evicting idle session {}", sid);
                sessions.remove(&sid);
            }
        }
    }

    /// Spawn the background eviction sweeper
    pub fn spawn_sweeper(
        store: Arc<Self>,
        idle_timeout: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep(idle_timeout).await;
            }
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
