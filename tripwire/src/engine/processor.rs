// tripwire/src/engine/processor.rs
//
// DetectionProcessor: the single place a failure or a detection becomes an
// action.
//
// Per report:
//   1. token validation       (fail → Ban, or Kick when nothing can be verified)
//   2. session lookup         (absent / still connecting → Ignore)
//   3. corroboration          (ground truth upgrades a claim to server_validated)
//   4. severity               (per-type weight, validated vs unvalidated)
//   5. trust update + bounded history
//   6. policy                 (Allow / hard Ban / Warn → escalate)
//
// A rejected token short-circuits before any session mutation. Work for one
// player serializes on that player's session mutex; different players never
// contend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::auth::TokenAuthority;
use crate::collab::GameStateProvider;
use crate::config::{Config, Escalation, PolicyConfig};
use crate::engine::corroborate::Corroborator;
use crate::engine::resources::{ResourcePolicy, RESOURCE_MISMATCH};
use crate::engine::severity::SeverityTable;
use crate::error::{ConfigError, TokenRejection};
use crate::events::{
    ActionKind, Decision, DetectionEvent, DetectionReport, DetectionSource, Payload, PlayerId,
    ResourceCheck, Token,
};
use crate::state::session::{Session, SessionStore};

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub processed:      AtomicU64,
    pub ignored:        AtomicU64,
    pub token_rejected: AtomicU64,
    pub unverifiable:   AtomicU64,
    pub corroborated:   AtomicU64,
}

pub struct DetectionProcessor {
    tokens:          Arc<TokenAuthority>,
    sessions:        Arc<SessionStore>,
    severity:        SeverityTable,
    policy:          PolicyConfig,
    high_confidence: HashSet<String>,
    corroborator:    Option<Corroborator>,
    resources:       ResourcePolicy,
    pub stats:       ProcessorStats,
}

impl DetectionProcessor {
    pub fn new(
        tokens:   Arc<TokenAuthority>,
        sessions: Arc<SessionStore>,
        config:   &Config,
        game:     Option<Arc<dyn GameStateProvider>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            tokens,
            sessions,
            severity:        SeverityTable::from_config(&config.severity)?,
            policy:          config.policy.clone(),
            high_confidence: config.policy.high_confidence_types.iter().cloned().collect(),
            corroborator:    game.map(|g| Corroborator::new(g, config.corroboration.clone())),
            resources:       ResourcePolicy::from_config(&config.resources)?,
            stats:           ProcessorStats::default(),
        })
    }

    pub fn tokens(&self) -> &Arc<TokenAuthority> { &self.tokens }
    pub fn sessions(&self) -> &Arc<SessionStore> { &self.sessions }
    pub fn corroborator(&self) -> Option<&Corroborator> { self.corroborator.as_ref() }

    // ── Entry points ──────────────────────────────────────────────────────────

    pub fn process(&self, player_id: PlayerId, report: &DetectionReport) -> Decision {
        self.process_at(player_id, report, Utc::now())
    }

    /// Client report: authenticate, then score as a client assertion.
    pub fn process_at(&self, player_id: PlayerId, report: &DetectionReport, now: DateTime<Utc>) -> Decision {
        if let Err(d) = self.authenticate(player_id, report.token.as_ref(), &report.detection_type, now) {
            return d;
        }
        self.score(player_id, &report.detection_type, report.payload.clone(), DetectionSource::client(), now)
    }

    /// Server-originated detection. No token: the server is the source.
    pub fn process_server(&self, player_id: PlayerId, detection_type: &str, payload: Payload, now: DateTime<Utc>) -> Decision {
        self.score(player_id, detection_type, payload, DetectionSource::server(), now)
    }

    /// Running-resource list. Violations are scored as `resource_mismatch`.
    pub fn process_resource_check(&self, player_id: PlayerId, check: &ResourceCheck, now: DateTime<Utc>) -> Decision {
        if let Err(d) = self.authenticate(player_id, check.token.as_ref(), RESOURCE_MISMATCH, now) {
            return d;
        }
        let violations = self.resources.violations(&check.running);
        if violations.is_empty() {
            let Some(handle) = self.sessions.get(player_id) else {
                return self.ignore(player_id, RESOURCE_MISMATCH, "no session", now);
            };
            let mut s = handle.lock();
            if !s.is_active() {
                return self.ignore(player_id, RESOURCE_MISMATCH, "session not active", now);
            }
            s.last_activity_at = now;
            let mut d = Decision::bare(player_id, ActionKind::Allow, "resource check clean", RESOURCE_MISMATCH, now);
            d.trust_score = s.trust_score;
            d.warning_count = s.warning_count;
            return d;
        }
        let payload = self.resources.mismatch_payload(&check.running, &violations);
        self.score(player_id, RESOURCE_MISMATCH, payload, DetectionSource::client(), now)
    }

    // ── Steps ─────────────────────────────────────────────────────────────────

    fn authenticate(&self, player_id: PlayerId, token: Option<&Token>, detection_type: &str, now: DateTime<Utc>) -> Result<(), Decision> {
        let result = match token {
            Some(t) => self.tokens.validate_at(player_id, t, now.timestamp()),
            None    => Err(TokenRejection::Malformed),
        };
        match result {
            Ok(()) => Ok(()),
            Err(TokenRejection::Unverifiable) => {
                self.stats.unverifiable.fetch_add(1, Ordering::Relaxed);
                warn!(player_id, "report cannot be verified: token authority disabled");
                Err(Decision::bare(player_id, ActionKind::Kick, "report verification unavailable", detection_type, now))
            }
            Err(rejection) => {
                self.stats.token_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(player_id, %rejection, "token rejected");
                Err(Decision::bare(
                    player_id,
                    ActionKind::Ban,
                    format!("invalid/replayed token: {}", rejection),
                    detection_type,
                    now,
                ))
            }
        }
    }

    fn score(&self, player_id: PlayerId, detection_type: &str, payload: Payload, mut source: DetectionSource, now: DateTime<Utc>) -> Decision {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let Some(handle) = self.sessions.get(player_id) else {
            warn!(player_id, detection_type, "detection for unknown session ignored");
            return self.ignore(player_id, detection_type, "no session", now);
        };
        let mut s = handle.lock();
        if !s.is_active() {
            debug!(player_id, detection_type, "detection before session activation ignored");
            return self.ignore(player_id, detection_type, "session not active", now);
        }
        s.last_activity_at = now;

        if !source.server_validated {
            if let Some(c) = &self.corroborator {
                if c.confirms(player_id, detection_type, &mut s, now) {
                    source.server_validated = true;
                    self.stats.corroborated.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let severity = self.severity.weight(detection_type, source.server_validated);
        s.recover(now, self.policy.trust_recovery_per_hour);
        let trust_score = s.deduct(severity);

        let event = DetectionEvent {
            detection_type: detection_type.to_string(),
            payload,
            source,
            severity,
            timestamp: now,
        };
        s.record(event.clone());

        let (action, reason) = self.decide(&mut s, detection_type, source, severity);
        debug!(
            player_id, detection_type, severity, trust_score,
            validated = source.server_validated, "{}", action
        );

        Decision {
            player_id,
            action,
            reason,
            detection_type: detection_type.to_string(),
            severity,
            trust_score,
            warning_count: s.warning_count,
            event: Some(event),
            timestamp: now,
        }
    }

    fn decide(&self, s: &mut Session, detection_type: &str, source: DetectionSource, severity: f32) -> (ActionKind, String) {
        if severity <= self.policy.min_actionable_severity {
            return (ActionKind::Allow, format!("{} below action threshold", detection_type));
        }

        if source.server_validated
            && self.high_confidence.contains(detection_type)
            && severity >= self.policy.hard_ban_threshold
        {
            return (ActionKind::Ban, format!("{} confirmed by server (severity {:.0})", detection_type, severity));
        }

        s.warning_count += 1;
        let threshold = self.policy.warning_threshold;
        if s.warning_count > threshold {
            s.warning_count = 0;
            let action = match self.policy.escalation {
                Escalation::Ban  => ActionKind::Ban,
                Escalation::Kick => ActionKind::Kick,
            };
            return (action, format!("{} after {} warnings", detection_type, threshold));
        }
        (ActionKind::Warn, format!("{} detected (warning {}/{})", detection_type, s.warning_count, threshold))
    }

    fn ignore(&self, player_id: PlayerId, detection_type: &str, reason: &str, now: DateTime<Utc>) -> Decision {
        self.stats.ignored.fetch_add(1, Ordering::Relaxed);
        Decision::bare(player_id, ActionKind::Ignore, reason, detection_type, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::testing::FakeGame;
    use crate::config::TokenConfig;
    use crate::events::{Position, VelocityState};
    use crate::state::session::MAX_TRUST;
    use chrono::TimeZone;

    const PLAYER: PlayerId = 42;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    struct Rig {
        proc: DetectionProcessor,
        game: Arc<FakeGame>,
    }

    fn rig_with(config: Config, secret: Option<&[u8]>) -> Rig {
        let game = Arc::new(FakeGame::default());
        let tokens = Arc::new(TokenAuthority::new(secret, &config.token));
        let sessions = Arc::new(SessionStore::new(config.session.history_capacity));
        let proc = DetectionProcessor::new(tokens, sessions, &config, Some(game.clone())).unwrap();
        proc.sessions().open(PLAYER, vec!["license:abc".into()], at(1000));
        proc.sessions().activate(PLAYER);
        Rig { proc, game }
    }

    fn rig() -> Rig { rig_with(Config::default(), Some(b"k")) }

    impl Rig {
        fn report(&self, kind: &str, t: i64) -> Decision {
            let token = self.proc.tokens().next_token_at(PLAYER, t).unwrap();
            let report = DetectionReport { detection_type: kind.into(), payload: Payload::new(), token: Some(token) };
            self.proc.process_at(PLAYER, &report, at(t))
        }

        fn trust(&self) -> f32 {
            self.proc.sessions().get(PLAYER).unwrap().lock().trust_score
        }
    }

    #[test]
    fn progressive_response_warn_warn_ban() {
        let r = rig();
        let actions: Vec<_> = (0..3).map(|i| r.report("aimbot", 1000 + i).action).collect();
        assert_eq!(actions, vec![ActionKind::Warn, ActionKind::Warn, ActionKind::Ban]);
        assert_eq!(r.proc.sessions().get(PLAYER).unwrap().lock().warning_count, 0);
    }

    #[test]
    fn escalation_can_be_kick() {
        let mut cfg = Config::default();
        cfg.policy.escalation = Escalation::Kick;
        cfg.policy.warning_threshold = 1;
        let r = rig_with(cfg, Some(b"k"));
        assert_eq!(r.report("aimbot", 1000).action, ActionKind::Warn);
        assert_eq!(r.report("aimbot", 1001).action, ActionKind::Kick);
    }

    #[test]
    fn forged_token_bans_without_touching_session() {
        let r = rig();
        let mut token = r.proc.tokens().next_token_at(PLAYER, 1000).unwrap();
        token.issued_at += 1;
        let report = DetectionReport { detection_type: "aimbot".into(), payload: Payload::new(), token: Some(token) };
        let d = r.proc.process_at(PLAYER, &report, at(1001));
        assert_eq!(d.action, ActionKind::Ban);
        assert!(d.reason.starts_with("invalid/replayed token"));
        assert_eq!(r.trust(), MAX_TRUST);
        assert!(r.proc.sessions().get(PLAYER).unwrap().lock().history.is_empty());
    }

    #[test]
    fn replayed_report_is_banned() {
        let r = rig();
        let token = r.proc.tokens().next_token_at(PLAYER, 1000).unwrap();
        let report = DetectionReport { detection_type: "spectate".into(), payload: Payload::new(), token: Some(token) };
        assert_eq!(r.proc.process_at(PLAYER, &report, at(1005)).action, ActionKind::Warn);
        let again = r.proc.process_at(PLAYER, &report, at(1010));
        assert_eq!(again.action, ActionKind::Ban);
        assert!(again.reason.contains("replayed"));
    }

    #[test]
    fn missing_token_is_malformed() {
        let r = rig();
        let report = DetectionReport { detection_type: "noclip".into(), payload: Payload::new(), token: None };
        let d = r.proc.process_at(PLAYER, &report, at(1000));
        assert_eq!(d.action, ActionKind::Ban);
        assert_eq!(r.proc.stats.token_rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disabled_authority_kicks_instead_of_banning() {
        let signer = TokenAuthority::new(Some(b"k"), &TokenConfig::default());
        let token = signer.next_token_at(PLAYER, 1000).unwrap();
        let r = rig_with(Config::default(), Some(b"changeme"));
        assert!(!r.proc.tokens().is_enabled());
        let report = DetectionReport { detection_type: "noclip".into(), payload: Payload::new(), token: Some(token) };
        let d = r.proc.process_at(PLAYER, &report, at(1000));
        assert_eq!(d.action, ActionKind::Kick);
        assert_eq!(d.reason, "report verification unavailable");
    }

    #[test]
    fn unknown_or_connecting_session_is_ignored() {
        let r = rig();
        let token = r.proc.tokens().next_token_at(7, 1000).unwrap();
        let report = DetectionReport { detection_type: "noclip".into(), payload: Payload::new(), token: Some(token) };
        assert_eq!(r.proc.process_at(7, &report, at(1000)).action, ActionKind::Ignore);

        r.proc.sessions().open(8, vec![], at(1000));
        assert_eq!(r.proc.process_server(8, "teleport", Payload::new(), at(1000)).action, ActionKind::Ignore);
        assert_eq!(r.proc.stats.ignored.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn trust_decreases_strictly_to_floor() {
        let mut cfg = Config::default();
        cfg.policy.warning_threshold = 1_000;
        let r = rig_with(cfg, Some(b"k"));
        let mut last = r.trust();
        assert_eq!(last, MAX_TRUST);
        for i in 0..20 {
            let d = r.report("aimbot", 1000 + i);
            assert!(d.trust_score >= 0.0);
            if last > 0.0 {
                assert!(d.trust_score < last);
            }
            last = d.trust_score;
        }
        assert_eq!(r.trust(), 0.0);
    }

    #[test]
    fn corroborated_speed_claim_is_hard_banned() {
        let r = rig();
        r.game.velocities.lock().insert(PLAYER, VelocityState { speed: 55.0, in_vehicle: false, falling: false });
        let d = r.report("speed_hack", 1000);
        assert_eq!(d.action, ActionKind::Ban);
        assert_eq!(d.severity, 40.0);
        assert!(d.event.unwrap().source.server_validated);
        assert_eq!(r.proc.stats.corroborated.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn uncorroborated_speed_claim_only_warns() {
        let r = rig();
        let d = r.report("speed_hack", 1000);
        assert_eq!(d.action, ActionKind::Warn);
        assert_eq!(d.severity, 10.0);
        assert_eq!(d.trust_score, 90.0);
    }

    #[test]
    fn server_teleport_detection_bans() {
        let r = rig();
        r.game.positions.lock().insert(PLAYER, Position::new(0.0, 0.0, 0.0));
        let d = r.proc.process_server(PLAYER, "teleport", Payload::new(), at(1000));
        assert_eq!(d.action, ActionKind::Ban);
        assert_eq!(d.severity, 45.0);
    }

    #[test]
    fn low_confidence_server_detection_still_progresses() {
        let r = rig();
        // noclip is server-validated but not in the high-confidence set.
        let d = r.proc.process_server(PLAYER, "noclip", Payload::new(), at(1000));
        assert_eq!(d.action, ActionKind::Warn);
        assert_eq!(d.severity, 30.0);
    }

    #[test]
    fn below_actionable_severity_is_silent() {
        let mut cfg = Config::default();
        cfg.policy.min_actionable_severity = 4.0;
        let r = rig_with(cfg, Some(b"k"));
        let d = r.report("spectate", 1000);
        assert_eq!(d.action, ActionKind::Allow);
        assert_eq!(d.trust_score, 96.0);
        assert_eq!(d.warning_count, 0);
    }

    #[test]
    fn resource_check_clean_and_dirty() {
        let r = rig();
        let token = r.proc.tokens().next_token_at(PLAYER, 1000).unwrap();
        let clean = ResourceCheck { running: vec!["chat".into()], token: Some(token.clone()) };
        assert_eq!(r.proc.process_resource_check(PLAYER, &clean, at(1000)).action, ActionKind::Allow);
        // The clean check consumed the token.
        assert_eq!(r.proc.process_resource_check(PLAYER, &clean, at(1001)).action, ActionKind::Ban);

        let r = rig();
        let token = r.proc.tokens().next_token_at(PLAYER, 1000).unwrap();
        let dirty = ResourceCheck { running: vec!["chat".into(), "ModMenu".into()], token: Some(token) };
        let d = r.proc.process_resource_check(PLAYER, &dirty, at(1000));
        assert_eq!(d.action, ActionKind::Warn);
        assert_eq!(d.detection_type, RESOURCE_MISMATCH);
        assert_eq!(d.severity, 15.0);
    }

    #[test]
    fn same_player_reports_serialize() {
        let mut cfg = Config::default();
        cfg.policy.warning_threshold = 1_000;
        let r = Arc::new(rig_with(cfg, Some(b"k")));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        r.report("spectate", 1000);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let handle = r.proc.sessions().get(PLAYER).unwrap();
        let s = handle.lock();
        assert_eq!(s.trust_score, MAX_TRUST - 20.0 * 4.0);
        assert_eq!(s.warning_count, 20);
    }

    #[test]
    fn other_players_proceed_while_one_session_is_held() {
        let r = Arc::new(rig());
        const OTHER: PlayerId = PLAYER + 1;
        r.proc.sessions().open(OTHER, vec!["license:other".into()], at(1000));
        r.proc.sessions().activate(OTHER);

        let held = r.proc.sessions().get(PLAYER).unwrap();
        let guard = held.lock();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker = {
            let r = Arc::clone(&r);
            std::thread::spawn(move || {
                let token = r.proc.tokens().next_token_at(OTHER, 1000).unwrap();
                let report = DetectionReport { detection_type: "noclip".into(), payload: Payload::new(), token: Some(token) };
                done_tx.send(r.proc.process_at(OTHER, &report, at(1000)).action).unwrap();
            })
        };

        let action = done_rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("report for another player blocked on a held session");
        assert_eq!(action, ActionKind::Warn);
        assert_eq!(guard.warning_count, 0);
        drop(guard);
        worker.join().unwrap();
    }
}
