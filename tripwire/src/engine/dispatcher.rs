// tripwire/src/engine/dispatcher.rs
//
// Executes Decisions against the collaborators.
//   BAN   → BanRegistry (persisted), disconnect with reason, drop session, notify
//   KICK  → disconnect with reason, drop session, notify
//   WARN  → warning frame to the player, notify
//   ALLOW / IGNORE → nothing beyond the history record
// Every scored event is queued for detection history. Persistence and
// notification failures never reverse a decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::ban_registry::BanRegistry;
use crate::collab::{ConnectionControl, Notifier};
use crate::events::{ActionKind, BanRecord, Decision, DetectionRecord};
use crate::persist::{PersistOp, PersistQueue};
use crate::state::session::SessionStore;

pub struct Dispatcher {
    sessions:      Arc<SessionStore>,
    bans:          Arc<BanRegistry>,
    connections:   Arc<dyn ConnectionControl>,
    notifier:      Arc<dyn Notifier>,
    persist:       Option<Arc<PersistQueue>>,
    ban_duration:  Option<Duration>,
    /// Executed actions, indexed by `ActionKind as usize`.
    pub executed:  [AtomicU64; 5],
}

impl Dispatcher {
    pub fn new(
        sessions:          Arc<SessionStore>,
        bans:              Arc<BanRegistry>,
        connections:       Arc<dyn ConnectionControl>,
        notifier:          Arc<dyn Notifier>,
        persist:           Option<Arc<PersistQueue>>,
        ban_duration_secs: Option<i64>,
    ) -> Self {
        Self {
            sessions,
            bans,
            connections,
            notifier,
            persist,
            ban_duration: ban_duration_secs.map(Duration::seconds),
            executed:     Default::default(),
        }
    }

    pub fn executed(&self, action: ActionKind) -> u64 {
        self.executed[action as usize].load(Ordering::Relaxed)
    }

    pub async fn dispatch(&self, decision: &Decision) {
        self.executed[decision.action as usize].fetch_add(1, Ordering::Relaxed);
        let player_id = decision.player_id;

        if let (Some(event), Some(p)) = (&decision.event, &self.persist) {
            p.enqueue(PersistOp::AppendDetection(DetectionRecord {
                player_id,
                timestamp: decision.timestamp,
                action:    decision.action,
                event:     event.clone(),
            }))
            .await;
        }

        match decision.action {
            ActionKind::Ban => {
                let identifiers = self.identifiers_for(player_id);
                let record = BanRecord {
                    identifiers,
                    player_id:  Some(player_id),
                    reason:     decision.reason.clone(),
                    banned_at:  decision.timestamp,
                    expires_at: self.ban_duration.map(|d| decision.timestamp + d),
                };
                self.bans.ban(record).await;
                self.connections.disconnect(player_id, &format!("Banned: {}", decision.reason));
                self.sessions.remove(player_id);
                info!(player_id, trust = decision.trust_score, "BAN {}", decision.reason);
                self.notify("ban", &format!("Player {} banned", player_id), decision);
            }
            ActionKind::Kick => {
                self.connections.disconnect(player_id, &format!("Kicked: {}", decision.reason));
                self.sessions.remove(player_id);
                info!(player_id, trust = decision.trust_score, "KICK {}", decision.reason);
                self.notify("kick", &format!("Player {} kicked", player_id), decision);
            }
            ActionKind::Warn => {
                self.connections.warn(player_id, &decision.reason);
                info!(player_id, trust = decision.trust_score, "WARN {}", decision.reason);
                self.notify("warning", &format!("Player {} warned", player_id), decision);
            }
            ActionKind::Allow | ActionKind::Ignore => {
                debug!(player_id, action = %decision.action, "{}", decision.reason);
            }
        }
    }

    /// Stable identifiers from the session, falling back to the live
    /// connection, falling back to the bare player id.
    fn identifiers_for(&self, player_id: u32) -> Vec<String> {
        let from_session = self.sessions.get(player_id)
            .map(|h| h.lock().identifiers.clone())
            .unwrap_or_default();
        if !from_session.is_empty() {
            return from_session;
        }
        let from_conn = self.connections.identifiers(player_id);
        if !from_conn.is_empty() {
            return from_conn;
        }
        vec![format!("player:{}", player_id)]
    }

    fn notify(&self, category: &str, title: &str, decision: &Decision) {
        let body = format!(
            "{} | type={} severity={:.1} trust={:.1}",
            decision.reason, decision.detection_type, decision.severity, decision.trust_score
        );
        if let Err(e) = self.notifier.notify(category, title, &body) {
            warn!(category, "notification failed: {:#}", e);
        }
    }
}
