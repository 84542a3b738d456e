// tripwire/src/monitor.rs
//
// ServerMonitor: periodic ground-truth sweep over every active session.
// Findings enter the processor as server-originated detections and their
// decisions go straight to the dispatcher. A player disconnected by one
// finding is not scored again in the same sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::engine::dispatcher::Dispatcher;
use crate::engine::processor::DetectionProcessor;
use crate::events::Decision;

pub struct ServerMonitor {
    processor:  Arc<DetectionProcessor>,
    dispatcher: Arc<Dispatcher>,
    every:      Duration,
}

impl ServerMonitor {
    pub fn new(processor: Arc<DetectionProcessor>, dispatcher: Arc<Dispatcher>, every: Duration) -> Self {
        Self { processor, dispatcher, every }
    }

    /// One sweep. Returns the decisions it produced.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Decision> {
        let Some(corroborator) = self.processor.corroborator() else {
            return Vec::new();
        };
        let sessions = self.processor.sessions();
        let mut decisions = Vec::new();

        for player_id in sessions.active_players() {
            let findings = match sessions.get(player_id) {
                Some(handle) => {
                    let mut s = handle.lock();
                    if !s.is_active() { continue; }
                    corroborator.observe(player_id, &mut s, now)
                }
                None => continue,
            };

            for f in findings {
                let d = self.processor.process_server(player_id, f.detection_type, f.payload, now);
                self.dispatcher.dispatch(&d).await;
                let stop = d.action.disconnects();
                decisions.push(d);
                if stop { break; }
            }
        }

        if !decisions.is_empty() {
            debug!(count = decisions.len(), "server monitor sweep");
        }
        decisions
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.every);
        loop {
            tick.tick().await;
            self.sweep(Utc::now()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthority;
    use crate::ban_registry::BanRegistry;
    use crate::collab::testing::{FakeGame, RecordingConnections, RecordingNotifier};
    use crate::config::Config;
    use crate::events::{ActionKind, VelocityState};
    use crate::state::session::SessionStore;

    #[tokio::test]
    async fn speeding_player_is_banned_once() {
        let cfg = Config::default();
        let game = Arc::new(FakeGame::default());
        let sessions = Arc::new(SessionStore::new(20));
        let tokens = Arc::new(TokenAuthority::new(Some(b"k"), &cfg.token));
        let processor = Arc::new(DetectionProcessor::new(tokens, sessions.clone(), &cfg, Some(game.clone())).unwrap());
        let conns = Arc::new(RecordingConnections::default());
        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            Arc::new(BanRegistry::new(None)),
            conns.clone(),
            Arc::new(RecordingNotifier::default()),
            None,
            None,
        ));
        let monitor = ServerMonitor::new(processor, dispatcher, Duration::from_secs(1));

        let now = Utc::now();
        for id in [1, 2] {
            sessions.open(id, vec![], now);
            sessions.activate(id);
        }
        // Player 1: speeding and impossible health. Player 2: clean.
        game.velocities.lock().insert(1, VelocityState { speed: 80.0, in_vehicle: false, falling: false });
        game.health.lock().insert(1, 5000.0);
        game.velocities.lock().insert(2, VelocityState { speed: 5.0, in_vehicle: false, falling: false });

        let decisions = monitor.sweep(now).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, ActionKind::Ban);
        assert_eq!(decisions[0].detection_type, "speed_hack");
        assert!(sessions.get(1).is_none());
        assert!(sessions.get(2).is_some());
        assert_eq!(conns.disconnected.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_game_state_means_no_sweep() {
        let cfg = Config::default();
        let sessions = Arc::new(SessionStore::new(20));
        let tokens = Arc::new(TokenAuthority::new(Some(b"k"), &cfg.token));
        let processor = Arc::new(DetectionProcessor::new(tokens, sessions.clone(), &cfg, None).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            Arc::new(BanRegistry::new(None)),
            Arc::new(RecordingConnections::default()),
            Arc::new(RecordingNotifier::default()),
            None,
            None,
        ));
        sessions.open(1, vec![], Utc::now());
        sessions.activate(1);
        let monitor = ServerMonitor::new(processor, dispatcher, Duration::from_secs(1));
        assert!(monitor.sweep(Utc::now()).await.is_empty());
    }
}
