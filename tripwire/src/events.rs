// tripwire/src/events.rs
//
// Shared domain types and every message shape flowing through Tripwire.
// Wire frames are JSON; field names here are the wire names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server-assigned per-connection player id.
pub type PlayerId = u32;

/// Free-form detector payload (`{"speed": 41.2, "limit": 12.0}` etc).
pub type Payload = HashMap<String, serde_json::Value>;

// ── Token ─────────────────────────────────────────────────────────────────────

/// Short-lived signed credential binding a report to a player and issue time.
///
/// `signature` is hex(HMAC-SHA256(player_id || issued_at || nonce)). The
/// `player_id` field is informational only: validation always recomputes the
/// MAC over the server-known id of the connection that presented the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub player_id: PlayerId,
    pub issued_at: i64, // unix seconds
    #[serde(default)]
    pub nonce: String,
    pub signature: String,
}

// ── Detection reports ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DetectionSource {
    pub client_asserted: bool,
    pub server_validated: bool,
}

impl DetectionSource {
    /// A claim made by the client about itself.
    pub fn client() -> Self {
        Self { client_asserted: true, server_validated: false }
    }

    /// An anomaly computed by the server from ground truth.
    pub fn server() -> Self {
        Self { client_asserted: false, server_validated: true }
    }
}

/// Client → server report from one detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub detection_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub token: Option<Token>,
}

/// Client → server list of running resources, checked against the resource policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCheck {
    pub running: Vec<String>,
    #[serde(default)]
    pub token: Option<Token>,
}

/// Scored detection as stored in a session's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub detection_type: String,
    pub payload: Payload,
    pub source: DetectionSource,
    pub severity: f32,
    pub timestamp: DateTime<Utc>,
}

// ── Decisions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Ignore,
    Allow,
    Warn,
    Kick,
    Ban,
}

impl ActionKind {
    /// Actions that end the connection.
    pub fn disconnects(self) -> bool {
        matches!(self, Self::Kick | Self::Ban)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ignore => write!(f, "IGNORE"),
            Self::Allow => write!(f, "ALLOW"),
            Self::Warn => write!(f, "WARN"),
            Self::Kick => write!(f, "KICK"),
            Self::Ban => write!(f, "BAN"),
        }
    }
}

/// Outcome of processing one report. Produced by the processor, executed by
/// the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub player_id: PlayerId,
    pub action: ActionKind,
    pub reason: String,
    pub detection_type: String,
    pub severity: f32,
    pub trust_score: f32,
    pub warning_count: u32,
    pub event: Option<DetectionEvent>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub(crate) fn bare(
        player_id: PlayerId,
        action: ActionKind,
        reason: impl Into<String>,
        detection_type: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            player_id,
            action,
            reason: reason.into(),
            detection_type: detection_type.to_string(),
            severity: 0.0,
            trust_score: 0.0,
            warning_count: 0,
            event: None,
            timestamp: now,
        }
    }
}

// ── Ground truth ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self { Self { x, y, z } }

    pub fn distance(&self, other: &Position) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityState {
    pub speed: f32, // units/sec
    pub in_vehicle: bool,
    pub falling: bool,
}

// ── Persisted records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanRecord {
    pub identifiers: Vec<String>,
    pub player_id: Option<PlayerId>,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>, // None = permanent
}

impl BanRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub player_id: PlayerId,
    pub timestamp: DateTime<Utc>,
    pub action: ActionKind,
    pub event: DetectionEvent,
}

// ── Wire frames ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { identifiers: Vec<String> },
    RequestToken { client_nonce: String },
    Report(DetectionReport),
    ResourceCheck(ResourceCheck),
    Goodbye,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { player_id: PlayerId },
    Token(Token),
    Ack { next_token: Option<Token> },
    Warning { reason: String },
    Disconnect { reason: String },
}

// ── Offline replay ────────────────────────────────────────────────────────────

/// One captured report for `tripwire replay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub player_id: PlayerId,
    pub detection_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub server_validated: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_use_tagged_wire_shape() {
        let raw = r#"{"type":"report","detection_type":"speed_hack","payload":{"speed":40.0},
                     "token":{"player_id":42,"issued_at":1000,"signature":"ab"}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Report(r) => {
                assert_eq!(r.detection_type, "speed_hack");
                let token = r.token.unwrap();
                assert_eq!(token.issued_at, 1000);
                assert!(token.nonce.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn report_without_token_still_decodes() {
        let raw = r#"{"type":"report","detection_type":"noclip"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, ClientFrame::Report(DetectionReport { token: None, .. })));
    }

    #[test]
    fn ban_expiry() {
        let now = Utc::now();
        let mut rec = BanRecord {
            identifiers: vec!["license:abc".into()],
            player_id: Some(1),
            reason: "test".into(),
            banned_at: now,
            expires_at: None,
        };
        assert!(rec.is_active(now));
        rec.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!rec.is_active(now));
    }

    #[test]
    fn only_kick_and_ban_disconnect() {
        assert!(ActionKind::Ban.disconnects());
        assert!(ActionKind::Kick.disconnects());
        assert!(!ActionKind::Warn.disconnects());
        assert!(!ActionKind::Allow.disconnects());
    }
}
