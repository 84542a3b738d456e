// tripwire/src/client/agent.rs
//
// Client endpoint: holds the current report token and turns detector hits
// into signed report frames.
//
// Token chain:
//   Welcome            → RequestToken(client_nonce)
//   Token(t)           → t becomes current
//   Report(.., t)      → t is spent; the next report waits for
//   Ack{next_token}    → next_token becomes current
// A token older than half the validity window is refreshed proactively.
//
// submit() never blocks: frames go out through mpsc::try_send, and reports
// that find no usable token wait in a small bounded backlog.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{ClientFrame, DetectionReport, Payload, PlayerId, ResourceCheck, ServerFrame, Token};
use crate::wire::{read_frame, write_frame};

const MAX_BACKLOG: usize = 32;

/// Where detector hits go. Must not block.
pub trait ReportSink: Send + Sync {
    fn submit(&self, detection_type: String, payload: Payload);
}

#[derive(Debug, Clone)]
enum Pending {
    Report { detection_type: String, payload: Payload },
    Resources(Vec<String>),
}

#[derive(Default)]
struct AgentState {
    player_id:         Option<PlayerId>,
    token:             Option<(Token, Instant)>,
    requested_at:      Option<Instant>,
    in_flight_since:   Option<Instant>,
    backlog:           VecDeque<Pending>,
    disconnect_reason: Option<String>,
}

pub struct ClientAgent {
    outbound:        mpsc::Sender<ClientFrame>,
    validity_window: Duration,
    state:           Mutex<AgentState>,
    nonce_counter:   AtomicU64,
    pub sent:        AtomicU64,
    pub dropped:     AtomicU64,
}

impl ClientAgent {
    pub fn new(outbound: mpsc::Sender<ClientFrame>, validity_window: Duration) -> Self {
        Self {
            outbound,
            validity_window,
            state:         Mutex::new(AgentState::default()),
            nonce_counter: AtomicU64::new(0),
            sent:          AtomicU64::new(0),
            dropped:       AtomicU64::new(0),
        }
    }

    pub fn player_id(&self) -> Option<PlayerId> { self.state.lock().player_id }
    pub fn has_token(&self) -> bool { self.state.lock().token.is_some() }
    pub fn disconnect_reason(&self) -> Option<String> { self.state.lock().disconnect_reason.clone() }
    pub fn backlog_len(&self) -> usize { self.state.lock().backlog.len() }

    pub fn submit_resources(&self, running: Vec<String>) {
        self.enqueue(Pending::Resources(running));
    }

    pub fn goodbye(&self) {
        let _ = self.outbound.try_send(ClientFrame::Goodbye);
    }

    /// Apply one server frame. Returns the reason when the server hung up.
    pub fn handle_frame(&self, frame: ServerFrame) -> Option<String> {
        let mut st = self.state.lock();
        match frame {
            ServerFrame::Welcome { player_id } => {
                info!(player_id, "connected");
                st.player_id = Some(player_id);
                self.request_token(&mut st);
            }
            ServerFrame::Token(token) => {
                st.requested_at = None;
                st.token = Some((token, Instant::now()));
                self.pump(&mut st);
            }
            ServerFrame::Ack { next_token } => {
                st.in_flight_since = None;
                if let Some(t) = next_token {
                    st.token = Some((t, Instant::now()));
                }
                self.pump(&mut st);
            }
            ServerFrame::Warning { reason } => {
                warn!("server warning: {}", reason);
            }
            ServerFrame::Disconnect { reason } => {
                warn!("disconnected by server: {}", reason);
                st.disconnect_reason = Some(reason.clone());
                st.backlog.clear();
                st.token = None;
                return Some(reason);
            }
        }
        None
    }

    /// Refresh a token past half its window; retry a request that got no answer.
    pub fn maintain(&self) {
        let mut st = self.state.lock();
        if st.disconnect_reason.is_some() || st.player_id.is_none() {
            return;
        }
        let half = self.validity_window / 2;
        let pending_request = st.requested_at.map(|at| at.elapsed() < half).unwrap_or(false);
        if pending_request {
            return;
        }
        if st.token.is_none() && self.awaiting_ack(&st) {
            return;
        }
        let stale = st.token.as_ref().map(|(_, at)| at.elapsed() >= half).unwrap_or(true);
        if stale {
            self.request_token(&mut st);
        }
    }

    pub async fn refresh_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval((self.validity_window / 4).max(Duration::from_millis(100)));
        loop {
            tick.tick().await;
            self.maintain();
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn enqueue(&self, item: Pending) {
        let mut st = self.state.lock();
        if st.disconnect_reason.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if st.backlog.len() >= MAX_BACKLOG {
            st.backlog.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        st.backlog.push_back(item);
        self.pump(&mut st);
    }

    /// Spend the current token on the oldest backlog item, if both exist.
    fn pump(&self, st: &mut AgentState) {
        if st.backlog.is_empty() {
            return;
        }
        let (token, received_at) = match st.token.take() {
            Some((t, at)) if at.elapsed() < self.validity_window => (t, at),
            _ => {
                if !self.awaiting_ack(st) {
                    self.request_token(st);
                }
                return;
            }
        };
        let Some(item) = st.backlog.pop_front() else { return };
        let frame = match item.clone() {
            Pending::Report { detection_type, payload } => {
                ClientFrame::Report(DetectionReport { detection_type, payload, token: Some(token.clone()) })
            }
            Pending::Resources(running) => {
                ClientFrame::ResourceCheck(ResourceCheck { running, token: Some(token.clone()) })
            }
        };
        match self.outbound.try_send(frame) {
            Ok(()) => {
                st.in_flight_since = Some(Instant::now());
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Not sent, so neither is spent.
                debug!("outbound full or closed: {}", e);
                st.token = Some((token, received_at));
                st.backlog.push_front(item);
            }
        }
    }

    /// A spent token's ack (carrying the next one) is still expected.
    fn awaiting_ack(&self, st: &AgentState) -> bool {
        st.in_flight_since.map(|at| at.elapsed() < self.validity_window / 2).unwrap_or(false)
    }

    fn request_token(&self, st: &mut AgentState) {
        if st.requested_at.map(|at| at.elapsed() < self.validity_window / 2).unwrap_or(false) {
            return;
        }
        let n = self.nonce_counter.fetch_add(1, Ordering::Relaxed);
        let client_nonce = format!("{:x}-{:x}", Utc::now().timestamp_micros(), n);
        if self.outbound.try_send(ClientFrame::RequestToken { client_nonce }).is_ok() {
            st.requested_at = Some(Instant::now());
        }
    }
}

impl ReportSink for ClientAgent {
    fn submit(&self, detection_type: String, payload: Payload) {
        self.enqueue(Pending::Report { detection_type, payload });
    }
}

// ── TCP transport ─────────────────────────────────────────────────────────────

pub struct ClientConnection {
    pub agent: Arc<ClientAgent>,
    /// Resolves when the server side closes; carries the disconnect reason if any.
    pub task:  JoinHandle<Option<String>>,
}

pub async fn connect(
    addr:            SocketAddr,
    identifiers:     Vec<String>,
    validity_window: Duration,
    max_frame:       usize,
) -> Result<ClientConnection> {
    let stream = TcpStream::connect(addr).await?;
    let (mut rd, mut wr) = stream.into_split();
    write_frame(&mut wr, &ClientFrame::Hello { identifiers }).await?;

    let (tx, mut rx) = mpsc::channel::<ClientFrame>(64);
    let agent = Arc::new(ClientAgent::new(tx, validity_window));

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut wr, &frame).await {
                warn!("client write failed: {}", e);
                break;
            }
        }
    });
    let refresher = tokio::spawn(Arc::clone(&agent).refresh_loop());

    let reader_agent = Arc::clone(&agent);
    let task = tokio::spawn(async move {
        let reason = loop {
            match read_frame::<_, ServerFrame>(&mut rd, max_frame).await {
                Ok(Some(frame)) => {
                    if let Some(reason) = reader_agent.handle_frame(frame) {
                        break Some(reason);
                    }
                }
                Ok(None) => break None,
                Err(e) => {
                    warn!("client read failed: {}", e);
                    break None;
                }
            }
        };
        refresher.abort();
        writer.abort();
        reason
    });

    Ok(ClientConnection { agent, task })
}
