// tripwire/src/config.rs
//
// Runtime configuration. Every section has defaults, so an absent or partial
// JSON file is fine. The signing secret is NOT part of this tree: it comes
// from TRIPWIRE_SECRET / --secret and is never serialized or logged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::severity::SeverityTable;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub token:         TokenConfig,
    pub session:       SessionConfig,
    pub policy:        PolicyConfig,
    pub severity:      SeverityConfig,
    pub resources:     ResourceConfig,
    pub corroboration: CorroborationConfig,
    pub monitor:       MonitorConfig,
    pub notifier:      NotifierConfig,
    pub persistence:   PersistenceConfig,
    pub scheduler:     SchedulerConfig,
    pub server:        ServerConfig,
}

impl Config {
    /// Load from a JSON file, or defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => serde_json::from_str(&std::fs::read_to_string(p)?)?,
            None    => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.validity_window_secs <= 0 {
            return Err(ConfigError::Invalid("token.validity_window_secs must be positive".into()));
        }
        if self.token.replay_buffer_secs < 0 {
            return Err(ConfigError::Invalid("token.replay_buffer_secs must not be negative".into()));
        }
        if self.session.history_capacity == 0 {
            return Err(ConfigError::Invalid("session.history_capacity must be at least 1".into()));
        }
        let s = &self.scheduler;
        if s.min_interval_ms == 0 || s.min_interval_ms > s.max_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "scheduler interval bounds invalid: min={}ms max={}ms",
                s.min_interval_ms, s.max_interval_ms
            )));
        }
        if s.max_suspicion <= 0.0 || !(0.0..=1.0).contains(&s.min_scale) || s.min_scale == 0.0 {
            return Err(ConfigError::Invalid("scheduler suspicion/scale settings invalid".into()));
        }
        if !(0.0..1.0).contains(&s.suspicion_decay) || s.max_load_factor < 1.0 {
            return Err(ConfigError::Invalid("scheduler decay/load settings invalid".into()));
        }
        SeverityTable::from_config(&self.severity)?;
        Ok(())
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub validity_window_secs:  i64,
    pub replay_buffer_secs:    i64,  // absorbs clock jitter on cache expiry
    pub cleanup_interval_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { validity_window_secs: 60, replay_buffer_secs: 5, cleanup_interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub history_capacity:        usize,
    pub inactivity_timeout_secs: i64,
    pub sweep_interval_secs:     u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { history_capacity: 20, inactivity_timeout_secs: 600, sweep_interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    Kick,
    Ban,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Warnings tolerated before the next detection escalates.
    pub warning_threshold:       u32,
    pub escalation:              Escalation,
    pub hard_ban_threshold:      f32,
    /// Types computed from ground truth; eligible for an immediate ban.
    pub high_confidence_types:   Vec<String>,
    pub ban_duration_secs:       Option<i64>,  // None = permanent
    pub trust_recovery_per_hour: f32,
    /// Severities at or below this update trust silently (Allow).
    pub min_actionable_severity: f32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            warning_threshold:       2,
            escalation:              Escalation::Ban,
            hard_ban_threshold:      40.0,
            high_confidence_types:   vec!["speed_hack".into(), "teleport".into(), "health_hack".into()],
            ban_duration_secs:       None,
            trust_recovery_per_hour: 0.0,
            min_actionable_severity: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityWeight {
    pub validated:   f32,
    pub unvalidated: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub default: SeverityWeight,
    pub types:   HashMap<String, SeverityWeight>,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        let rows: &[(&str, f32, f32)] = &[
            ("speed_hack",        40.0, 10.0),
            ("teleport",          45.0, 10.0),
            ("health_hack",       50.0, 12.0),
            ("godmode",           50.0, 12.0),
            ("noclip",            30.0,  8.0),
            ("aimbot",            35.0,  8.0),
            ("weapon_clip",       25.0,  6.0),
            ("spectate",          10.0,  4.0),
            ("resource_mismatch", 30.0, 15.0),
        ];
        Self {
            default: SeverityWeight { validated: 10.0, unvalidated: 5.0 },
            types: rows.iter()
                .map(|(t, v, u)| (t.to_string(), SeverityWeight { validated: *v, unvalidated: *u }))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMode {
    AllowList,
    DenyList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub mode:    ResourceMode,
    pub entries: Vec<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            mode:    ResourceMode::DenyList,
            entries: vec!["cheatengine".into(), "injector".into(), "modmenu".into(), "esp_overlay".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorroborationConfig {
    pub max_foot_speed:        f32,  // units/sec
    pub max_vehicle_speed:     f32,
    pub max_teleport_distance: f32,  // units between consecutive observations
    pub max_health:            f32,
}

impl Default for CorroborationConfig {
    fn default() -> Self {
        Self { max_foot_speed: 12.0, max_vehicle_speed: 95.0, max_teleport_distance: 150.0, max_health: 200.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled:           bool,
    pub sweep_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { enabled: false, sweep_interval_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub cooldown_secs: i64,  // per category
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { cooldown_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub output_dir:        PathBuf,
    pub max_queue:         usize,
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            output_dir:        PathBuf::from("/tmp/tripwire_output"),
            max_queue:         8192,
            flush_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_ms:     u64,
    pub max_interval_ms:     u64,
    pub max_suspicion:       f32,
    pub suspicion_increment: f32,
    /// Fraction of suspicion shed after a clean run.
    pub suspicion_decay:     f32,
    /// Scale factor at maximum suspicion (interval multiplier floor).
    pub min_scale:           f32,
    pub max_load_factor:     f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms:     250,
            max_interval_ms:     30_000,
            max_suspicion:       100.0,
            suspicion_increment: 20.0,
            suspicion_decay:     0.05,
            min_scale:           0.25,
            max_load_factor:     4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen:          SocketAddr,
    pub metrics:         Option<SocketAddr>,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen:          SocketAddr::from(([127, 0, 0, 1], 30120)),
            metrics:         Some(SocketAddr::from(([127, 0, 0, 1], 9092))),
            max_frame_bytes: 64 * 1024,
        }
    }
}
