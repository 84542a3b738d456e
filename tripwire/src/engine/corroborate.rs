// tripwire/src/engine/corroborate.rs
//
// Ground-truth checks against the Game State Provider.
//
// Used two ways:
//   - confirm a client-asserted report (marks it server_validated)
//   - ServerMonitor sweeps, which emit server-originated detections
//
// Checks:
//   speed_hack   velocity above the on-foot / vehicle limit (falling exempt)
//   teleport     displacement between consecutive observations above both
//                the teleport limit and what vehicle speed could cover
//   health_hack  health above the configured maximum (godmode shares it)

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::collab::GameStateProvider;
use crate::config::CorroborationConfig;
use crate::events::{Payload, PlayerId};
use crate::state::session::Session;

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub detection_type: &'static str,
    pub payload:        Payload,
}

pub struct Corroborator {
    game: Arc<dyn GameStateProvider>,
    cfg:  CorroborationConfig,
}

impl Corroborator {
    pub fn new(game: Arc<dyn GameStateProvider>, cfg: CorroborationConfig) -> Self {
        Self { game, cfg }
    }

    /// Run every ground-truth check for `player_id`, updating the session's
    /// last observed position. Caller holds the session lock.
    pub fn observe(&self, player_id: PlayerId, session: &mut Session, now: DateTime<Utc>) -> Vec<Finding> {
        let mut out = Vec::new();
        let velocity = self.game.get_velocity_state(player_id);
        let in_vehicle = session.flags.in_vehicle || velocity.map(|v| v.in_vehicle).unwrap_or(false);

        // ── Speed ─────────────────────────────────────────────────────────────
        if let Some(v) = velocity {
            let limit = if in_vehicle { self.cfg.max_vehicle_speed } else { self.cfg.max_foot_speed };
            if !v.falling && v.speed > limit {
                out.push(finding("speed_hack", json!({ "speed": v.speed, "limit": limit, "in_vehicle": in_vehicle })));
            }
        }

        // ── Teleport ──────────────────────────────────────────────────────────
        if let Some(pos) = self.game.get_position(player_id) {
            if let Some((prev, at)) = session.last_position {
                let elapsed = (now - at).num_milliseconds().max(0) as f32 / 1000.0;
                let distance = pos.distance(&prev);
                let reachable = self.cfg.max_vehicle_speed * elapsed;
                if !session.flags.just_spawned
                    && distance > self.cfg.max_teleport_distance
                    && distance > reachable
                {
                    out.push(finding("teleport", json!({
                        "distance": distance, "elapsed_secs": elapsed, "limit": self.cfg.max_teleport_distance,
                    })));
                }
            }
            session.last_position = Some((pos, now));
            session.flags.just_spawned = false;
        }

        // ── Health ────────────────────────────────────────────────────────────
        if let Some(hp) = self.game.get_health(player_id) {
            if hp > self.cfg.max_health {
                out.push(finding("health_hack", json!({ "health": hp, "max": self.cfg.max_health })));
            }
        }

        out
    }

    /// Whether ground truth backs a client claim of `detection_type`.
    pub fn confirms(&self, player_id: PlayerId, detection_type: &str, session: &mut Session, now: DateTime<Utc>) -> bool {
        let wanted = match detection_type {
            "speed_hack" => "speed_hack",
            "teleport" => "teleport",
            "health_hack" | "godmode" => "health_hack",
            _ => return false,
        };
        self.observe(player_id, session, now).iter().any(|f| f.detection_type == wanted)
    }
}

fn finding(detection_type: &'static str, body: serde_json::Value) -> Finding {
    let payload = match body {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Payload::new(),
    };
    Finding { detection_type, payload }
}
