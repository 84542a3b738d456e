// tripwire/src/replay.rs
//
// Offline dry run of the scoring policy over captured reports.
//
// Each record is pushed through the real processor: client records get a
// freshly minted token (so the token path is exercised too), server records
// enter through process_server. Nothing is dispatched. A disconnecting
// decision drops the session, so a later record for the same player starts
// over the way a reconnect would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;

use crate::auth::TokenAuthority;
use crate::config::Config;
use crate::engine::processor::DetectionProcessor;
use crate::error::ConfigError;
use crate::events::{ActionKind, Decision, DetectionReport, PlayerId, ReplayRecord};
use crate::state::session::SessionStore;

const DRY_RUN_SECRET: &[u8] = b"tripwire-dry-run-key";

#[derive(Debug, Default, Clone)]
pub struct ReplaySummary {
    pub records:   u64,
    pub skipped:   u64,
    pub by_action: BTreeMap<ActionKind, u64>,
    pub removed:   BTreeSet<PlayerId>,
}

impl ReplaySummary {
    pub fn count(&self, action: ActionKind) -> u64 {
        self.by_action.get(&action).copied().unwrap_or(0)
    }
}

pub struct DryRun {
    tokens:    Arc<TokenAuthority>,
    sessions:  Arc<SessionStore>,
    processor: DetectionProcessor,
    pub summary: ReplaySummary,
}

impl DryRun {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let tokens = Arc::new(TokenAuthority::new(Some(DRY_RUN_SECRET), &config.token));
        let sessions = Arc::new(SessionStore::new(config.session.history_capacity));
        let processor = DetectionProcessor::new(tokens.clone(), sessions.clone(), config, None)?;
        Ok(Self { tokens, sessions, processor, summary: ReplaySummary::default() })
    }

    /// Parse one JSONL line; blank and unparsable lines count as skipped.
    pub fn apply_line(&mut self, line: &str) -> Option<Decision> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<ReplayRecord>(line) {
            Ok(rec) => Some(self.apply(&rec)),
            Err(e) => {
                tracing::warn!("Parse error: {}", e);
                self.summary.skipped += 1;
                None
            }
        }
    }

    pub fn apply(&mut self, rec: &ReplayRecord) -> Decision {
        let now = rec.timestamp.unwrap_or_else(Utc::now);
        let player_id = rec.player_id;
        if self.sessions.get(player_id).is_none() {
            self.sessions.open(player_id, vec![format!("player:{}", player_id)], now);
            self.sessions.activate(player_id);
        }

        let decision = if rec.server_validated {
            self.processor.process_server(player_id, &rec.detection_type, rec.payload.clone(), now)
        } else {
            let report = DetectionReport {
                detection_type: rec.detection_type.clone(),
                payload:        rec.payload.clone(),
                token:          self.tokens.next_token_at(player_id, now.timestamp()).ok(),
            };
            self.processor.process_at(player_id, &report, now)
        };

        if decision.action.disconnects() {
            self.sessions.remove(player_id);
            self.summary.removed.insert(player_id);
        }
        self.summary.records += 1;
        *self.summary.by_action.entry(decision.action).or_insert(0) += 1;
        decision
    }
}
