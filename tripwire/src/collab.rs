// tripwire/src/collab.rs
//
// Collaborators the core consumes but does not own:
//
//   GameStateProvider  — read-only ground truth (position, health, velocity)
//   Datastore          — ban + detection-history persistence (async)
//   Notifier           — best-effort operator alerts
//   ConnectionControl  — drop/warn a live connection, look up its identifiers
//
// Shipped implementations: NullGameState, JsonlDatastore, TracingNotifier,
// and RateLimitedNotifier (per-category cooldown wrapper).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::events::{BanRecord, DetectionRecord, PlayerId, Position, VelocityState};

// ── Traits ────────────────────────────────────────────────────────────────────

pub trait GameStateProvider: Send + Sync {
    fn get_position(&self, player_id: PlayerId) -> Option<Position>;
    fn get_health(&self, player_id: PlayerId) -> Option<f32>;
    fn get_velocity_state(&self, player_id: PlayerId) -> Option<VelocityState>;
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn save_ban(&self, record: &BanRecord) -> Result<()>;
    async fn is_banned(&self, identifiers: &[String]) -> Result<bool>;
    async fn append_detection_history(&self, record: &DetectionRecord) -> Result<()>;
    async fn load_bans(&self) -> Result<Vec<BanRecord>>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, category: &str, title: &str, body: &str) -> Result<()>;
}

pub trait ConnectionControl: Send + Sync {
    fn disconnect(&self, player_id: PlayerId, reason: &str);
    fn warn(&self, player_id: PlayerId, reason: &str);
    fn identifiers(&self, player_id: PlayerId) -> Vec<String>;
    fn is_live(&self, player_id: PlayerId) -> bool;
}

// ── NullGameState ─────────────────────────────────────────────────────────────

/// Standalone daemon with no embedded game: nothing can be corroborated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGameState;

impl GameStateProvider for NullGameState {
    fn get_position(&self, _: PlayerId) -> Option<Position> { None }
    fn get_health(&self, _: PlayerId) -> Option<f32> { None }
    fn get_velocity_state(&self, _: PlayerId) -> Option<VelocityState> { None }
}

// ── JsonlDatastore ────────────────────────────────────────────────────────────

pub const BANS_FILE: &str = "bans.jsonl";
pub const DETECTIONS_FILE: &str = "detections.jsonl";

/// Append-only JSONL files in one output directory.
pub struct JsonlDatastore {
    out: PathBuf,
}

impl JsonlDatastore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }

    pub fn dir(&self) -> &Path { &self.out }

    async fn append(&self, file: &str, line: String) -> Result<()> {
        let mut f = OpenOptions::new().create(true).append(true)
            .open(self.out.join(file)).await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_bans(&self) -> Result<Vec<BanRecord>> {
        let path = self.out.join(BANS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() { continue; }
            match serde_json::from_str::<BanRecord>(line) {
                Ok(r)  => records.push(r),
                Err(e) => warn!("{}:{}: skipping bad ban record: {}", path.display(), n + 1, e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Datastore for JsonlDatastore {
    async fn save_ban(&self, record: &BanRecord) -> Result<()> {
        self.append(BANS_FILE, serde_json::to_string(record)?).await
    }

    async fn is_banned(&self, identifiers: &[String]) -> Result<bool> {
        let now = Utc::now();
        Ok(self.read_bans().await?.iter().any(|b| {
            b.is_active(now) && b.identifiers.iter().any(|id| identifiers.contains(id))
        }))
    }

    async fn append_detection_history(&self, record: &DetectionRecord) -> Result<()> {
        self.append(DETECTIONS_FILE, serde_json::to_string(record)?).await
    }

    async fn load_bans(&self) -> Result<Vec<BanRecord>> {
        self.read_bans().await
    }
}

// ── Notifiers ─────────────────────────────────────────────────────────────────

/// Operator alerts as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, category: &str, title: &str, body: &str) -> Result<()> {
        warn!(category, "{}: {}", title, body);
        Ok(())
    }
}

/// Wraps a notifier with a per-category cooldown. Failures of the inner
/// notifier are logged and swallowed.
pub struct RateLimitedNotifier<N> {
    inner:          N,
    cooldown:       Duration,
    last_sent:      DashMap<String, DateTime<Utc>>,
    pub sent:       AtomicU64,
    pub suppressed: AtomicU64,
    pub failed:     AtomicU64,
}

impl<N: Notifier> RateLimitedNotifier<N> {
    pub fn new(inner: N, cooldown_secs: i64) -> Self {
        Self {
            inner,
            cooldown:   Duration::seconds(cooldown_secs.max(0)),
            last_sent:  DashMap::new(),
            sent:       AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            failed:     AtomicU64::new(0),
        }
    }

    /// Returns true if the notification was handed to the inner notifier.
    pub fn notify_at(&self, category: &str, title: &str, body: &str, now: DateTime<Utc>) -> bool {
        match self.last_sent.entry(category.to_string()) {
            Entry::Occupied(mut e) => {
                if now - *e.get() < self.cooldown {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    debug!(category, "notification suppressed by cooldown");
                    return false;
                }
                e.insert(now);
            }
            Entry::Vacant(v) => { v.insert(now); }
        }

        match self.inner.notify(category, title, body) {
            Ok(()) => { self.sent.fetch_add(1, Ordering::Relaxed); }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(category, "notifier failed: {:#}", e);
            }
        }
        true
    }
}

impl<N: Notifier> Notifier for RateLimitedNotifier<N> {
    fn notify(&self, category: &str, title: &str, body: &str) -> Result<()> {
        self.notify_at(category, title, body, Utc::now());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Recording fakes shared by unit tests across modules.
    #[derive(Default)]
    pub struct FakeGame {
        pub positions:  Mutex<HashMap<PlayerId, Position>>,
        pub health:     Mutex<HashMap<PlayerId, f32>>,
        pub velocities: Mutex<HashMap<PlayerId, VelocityState>>,
    }

    impl GameStateProvider for FakeGame {
        fn get_position(&self, p: PlayerId) -> Option<Position> { self.positions.lock().get(&p).copied() }
        fn get_health(&self, p: PlayerId) -> Option<f32> { self.health.lock().get(&p).copied() }
        fn get_velocity_state(&self, p: PlayerId) -> Option<VelocityState> { self.velocities.lock().get(&p).copied() }
    }

    #[derive(Default)]
    pub struct RecordingStore {
        pub bans:       Mutex<Vec<BanRecord>>,
        pub detections: Mutex<Vec<DetectionRecord>>,
        pub fail:       std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Datastore for RecordingStore {
        async fn save_ban(&self, record: &BanRecord) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) { anyhow::bail!("datastore offline"); }
            self.bans.lock().push(record.clone());
            Ok(())
        }
        async fn is_banned(&self, ids: &[String]) -> Result<bool> {
            Ok(self.bans.lock().iter().any(|b| b.identifiers.iter().any(|i| ids.contains(i))))
        }
        async fn append_detection_history(&self, record: &DetectionRecord) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) { anyhow::bail!("datastore offline"); }
            self.detections.lock().push(record.clone());
            Ok(())
        }
        async fn load_bans(&self) -> Result<Vec<BanRecord>> {
            Ok(self.bans.lock().clone())
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, category: &str, title: &str, _body: &str) -> Result<()> {
            if self.fail { anyhow::bail!("webhook down"); }
            self.sent.lock().push((category.to_string(), title.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingConnections {
        pub disconnected: Mutex<Vec<(PlayerId, String)>>,
        pub warned:       Mutex<Vec<(PlayerId, String)>>,
        pub ids:          Mutex<HashMap<PlayerId, Vec<String>>>,
    }

    impl ConnectionControl for RecordingConnections {
        fn disconnect(&self, p: PlayerId, reason: &str) { self.disconnected.lock().push((p, reason.to_string())); }
        fn warn(&self, p: PlayerId, reason: &str) { self.warned.lock().push((p, reason.to_string())); }
        fn identifiers(&self, p: PlayerId) -> Vec<String> { self.ids.lock().get(&p).cloned().unwrap_or_default() }
        fn is_live(&self, p: PlayerId) -> bool {
            !self.disconnected.lock().iter().any(|(id, _)| *id == p)
        }
    }
}
