// tripwire/src/server.rs
//
// TCP ingress and component wiring.
//
// Wire protocol: length-prefixed JSON frames (see wire.rs).
//
// Per connection:
//   ← Hello{identifiers}       ban check → Welcome{player_id} | Disconnect
//   ← RequestToken{nonce}      → Token
//   ← Report / ResourceCheck   → processor → dispatcher → Ack{next_token}
//                                (no ack when the decision disconnects)
//   ← Goodbye / EOF            session dropped
//
// The connection table is both the ConnectionControl the dispatcher acts on
// and the liveness predicate for the stale-session sweep.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::token::MAX_NONCE_BYTES;
use crate::auth::TokenAuthority;
use crate::ban_registry::BanRegistry;
use crate::collab::{ConnectionControl, Datastore, GameStateProvider, Notifier, RateLimitedNotifier, TracingNotifier};
use crate::config::Config;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::processor::DetectionProcessor;
use crate::error::{ConfigError, FrameError};
use crate::events::{ClientFrame, PlayerId, ServerFrame};
use crate::metrics::TripwireMetrics;
use crate::monitor::ServerMonitor;
use crate::persist::PersistQueue;
use crate::state::session::SessionStore;
use crate::wire::{read_frame, write_frame};

const OUTBOUND_DEPTH: usize = 64;
const BAN_PURGE_EVERY: Duration = Duration::from_secs(60);

// ── Connection table ──────────────────────────────────────────────────────────

struct Conn {
    tx:          mpsc::Sender<ServerFrame>,
    identifiers: Vec<String>,
    closed:      Arc<Notify>,
}

#[derive(Default)]
pub struct Connections {
    table: DashMap<PlayerId, Conn>,
}

impl Connections {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.table.len() }
    pub fn is_empty(&self) -> bool { self.table.is_empty() }

    fn insert(&self, player_id: PlayerId, conn: Conn) {
        self.table.insert(player_id, conn);
    }

    fn remove(&self, player_id: PlayerId) {
        self.table.remove(&player_id);
    }
}

impl ConnectionControl for Connections {
    fn disconnect(&self, player_id: PlayerId, reason: &str) {
        if let Some((_, conn)) = self.table.remove(&player_id) {
            let _ = conn.tx.try_send(ServerFrame::Disconnect { reason: reason.to_string() });
            conn.closed.notify_one();
        }
    }

    fn warn(&self, player_id: PlayerId, reason: &str) {
        if let Some(conn) = self.table.get(&player_id) {
            let _ = conn.tx.try_send(ServerFrame::Warning { reason: reason.to_string() });
        }
    }

    fn identifiers(&self, player_id: PlayerId) -> Vec<String> {
        self.table.get(&player_id).map(|c| c.identifiers.clone()).unwrap_or_default()
    }

    fn is_live(&self, player_id: PlayerId) -> bool {
        self.table.contains_key(&player_id)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    pub config:      Config,
    pub tokens:      Arc<TokenAuthority>,
    pub sessions:    Arc<SessionStore>,
    pub processor:   Arc<DetectionProcessor>,
    pub dispatcher:  Arc<Dispatcher>,
    pub bans:        Arc<BanRegistry>,
    pub persist:     Arc<PersistQueue>,
    pub connections: Arc<Connections>,
    pub metrics:     Arc<TripwireMetrics>,
    datastore:       Arc<dyn Datastore>,
    next_player:     AtomicU32,
}

impl Server {
    pub fn build(
        config:    Config,
        secret:    Option<&[u8]>,
        game:      Option<Arc<dyn GameStateProvider>>,
        datastore: Arc<dyn Datastore>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let tokens = Arc::new(TokenAuthority::new(secret, &config.token));
        let sessions = Arc::new(SessionStore::new(config.session.history_capacity));
        let processor = Arc::new(DetectionProcessor::new(tokens.clone(), sessions.clone(), &config, game)?);
        let persist = PersistQueue::new(datastore.clone(), &config.persistence);
        let bans = Arc::new(BanRegistry::new(Some(persist.clone())));
        let connections = Arc::new(Connections::new());
        let notifier: Arc<dyn Notifier> =
            Arc::new(RateLimitedNotifier::new(TracingNotifier, config.notifier.cooldown_secs));
        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            bans.clone(),
            connections.clone(),
            notifier,
            Some(persist.clone()),
            config.policy.ban_duration_secs,
        ));
        let metrics = TripwireMetrics::new(processor.clone(), dispatcher.clone(), bans.clone(), Some(persist.clone()));

        Ok(Arc::new(Self {
            config,
            tokens,
            sessions,
            processor,
            dispatcher,
            bans,
            persist,
            connections,
            metrics,
            datastore,
            next_player: AtomicU32::new(1),
        }))
    }

    /// Load stored bans into the registry.
    pub async fn warm_bans(&self) -> Result<usize> {
        let records = self.datastore.load_bans().await?;
        let n = self.bans.load(records, Utc::now());
        info!("Loaded {} active bans", n);
        Ok(n)
    }

    /// Timers: replay-cache cleanup, stale-session sweep, ban purge,
    /// persistence flush, and the server monitor when enabled.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cfg = &self.config;
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.tokens.clone().cleanup_loop(Duration::from_secs(cfg.token.cleanup_interval_secs.max(1))),
        ));

        let server = Arc::clone(self);
        let every = Duration::from_secs(cfg.session.sweep_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                server.sweep_sessions(Utc::now());
            }
        }));

        let bans = self.bans.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(BAN_PURGE_EVERY);
            loop {
                tick.tick().await;
                let n = bans.purge_expired(Utc::now());
                if n > 0 { debug!(purged = n, "expired bans purged"); }
            }
        }));

        handles.push(tokio::spawn(self.persist.clone().flush_loop()));

        if cfg.monitor.enabled {
            let monitor = Arc::new(ServerMonitor::new(
                self.processor.clone(),
                self.dispatcher.clone(),
                Duration::from_millis(cfg.monitor.sweep_interval_ms.max(1)),
            ));
            handles.push(tokio::spawn(monitor.run()));
        }
        handles
    }

    /// Drop stale sessions. A swept session whose connection is still open
    /// takes the connection with it, so no connection outlives its session.
    pub fn sweep_sessions(&self, now: chrono::DateTime<Utc>) -> Vec<PlayerId> {
        let timeout = chrono::Duration::seconds(self.config.session.inactivity_timeout_secs);
        let swept = self.sessions.sweep_stale(now, timeout, |id| self.connections.is_live(id));
        for &id in &swept {
            if self.connections.is_live(id) {
                self.connections.disconnect(id, "session expired");
            }
        }
        swept
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Ingress listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            self.metrics.record_connection();
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!(%peer, "connection ended: {:#}", e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let max_frame = self.config.server.max_frame_bytes;
        let (mut rd, mut wr) = stream.into_split();

        // ── Handshake ─────────────────────────────────────────────────────────
        let identifiers = match read_frame::<_, ClientFrame>(&mut rd, max_frame).await {
            Ok(Some(ClientFrame::Hello { identifiers }))
                if !identifiers.is_empty() && identifiers.iter().all(|id| !id.trim().is_empty()) => identifiers,
            Ok(Some(ClientFrame::Hello { .. })) => {
                // Bans key on these; without one a ban could not follow the player.
                self.metrics.record_bad_frame();
                let bye = ServerFrame::Disconnect { reason: "malformed handshake".into() };
                write_frame(&mut wr, &bye).await?;
                return Ok(());
            }
            Ok(Some(_)) | Err(FrameError::Decode(_)) => {
                self.metrics.record_bad_frame();
                let bye = ServerFrame::Disconnect { reason: "expected hello".into() };
                write_frame(&mut wr, &bye).await?;
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.metrics.record_frame();

        let now = Utc::now();
        if let Some(ban) = self.bans.check(&identifiers, now) {
            info!(%peer, "banned identifier refused: {}", ban.reason);
            write_frame(&mut wr, &ServerFrame::Disconnect { reason: format!("Banned: {}", ban.reason) }).await?;
            return Ok(());
        }

        let player_id = self.next_player.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_DEPTH);
        let closed = Arc::new(Notify::new());
        self.connections.insert(player_id, Conn {
            tx:          tx.clone(),
            identifiers: identifiers.clone(),
            closed:      closed.clone(),
        });
        self.sessions.open(player_id, identifiers, now);
        self.sessions.activate(player_id);
        info!(player_id, %peer, "player connected");

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let last = matches!(frame, ServerFrame::Disconnect { .. });
                if write_frame(&mut wr, &frame).await.is_err() || last {
                    break;
                }
            }
            let _ = wr.shutdown().await;
        });
        // A failed send means the writer is gone; the read below sees the EOF.
        let _ = tx.send(ServerFrame::Welcome { player_id }).await;

        // ── Frames ────────────────────────────────────────────────────────────
        loop {
            let next = tokio::select! {
                res = read_frame::<_, ClientFrame>(&mut rd, max_frame) => res,
                _ = closed.notified() => break,
            };
            let frame = match next {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    self.metrics.record_bad_frame();
                    warn!(player_id, "bad frame: {}", e);
                    self.connections.disconnect(player_id, "malformed frame");
                    break;
                }
            };
            self.metrics.record_frame();
            match self.handle_frame(player_id, frame, &tx).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    debug!(player_id, "outbound closed: {:#}", e);
                    break;
                }
            }
        }

        self.connections.remove(player_id);
        self.sessions.remove(player_id);
        drop(tx);
        let _ = writer.await;
        info!(player_id, "player disconnected");
        Ok(())
    }

    /// Returns false when the connection should close.
    async fn handle_frame(&self, player_id: PlayerId, frame: ClientFrame, tx: &mpsc::Sender<ServerFrame>) -> Result<bool> {
        let now = Utc::now();
        match frame {
            ClientFrame::Hello { .. } => {
                self.sessions.touch(player_id, now);
                debug!(player_id, "duplicate hello ignored");
            }
            ClientFrame::RequestToken { client_nonce } => {
                if client_nonce.len() > MAX_NONCE_BYTES {
                    self.connections.disconnect(player_id, "malformed handshake");
                    return Ok(false);
                }
                self.sessions.touch(player_id, now);
                match self.tokens.issue_bound_token_at(player_id, &client_nonce, now.timestamp()) {
                    Ok(token) => tx.send(ServerFrame::Token(token)).await?,
                    Err(e) => {
                        // Handshake disabled. The session stays up but can never report.
                        tx.send(ServerFrame::Warning { reason: format!("report channel unavailable: {}", e) }).await?;
                    }
                }
            }
            ClientFrame::Report(report) => {
                let decision = self.processor.process_at(player_id, &report, now);
                return self.conclude(player_id, &decision, tx, now).await;
            }
            ClientFrame::ResourceCheck(check) => {
                let decision = self.processor.process_resource_check(player_id, &check, now);
                return self.conclude(player_id, &decision, tx, now).await;
            }
            ClientFrame::Goodbye => return Ok(false),
        }
        Ok(true)
    }

    async fn conclude(
        &self,
        player_id: PlayerId,
        decision:  &crate::events::Decision,
        tx:        &mpsc::Sender<ServerFrame>,
        now:       chrono::DateTime<Utc>,
    ) -> Result<bool> {
        self.dispatcher.dispatch(decision).await;
        if decision.action.disconnects() {
            return Ok(false);
        }
        // The token passed, so the report counts as activity.
        self.sessions.touch(player_id, now);
        let next_token = self.tokens.next_token_at(player_id, now.timestamp()).ok();
        tx.send(ServerFrame::Ack { next_token }).await?;
        Ok(true)
    }
}
