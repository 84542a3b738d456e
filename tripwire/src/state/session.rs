// tripwire/src/state/session.rs
//
// Per-player session store.
// DashMap = sharded concurrent HashMap: reports for different players never
// block each other. Each session sits behind its own mutex, so reports for
// the same player serialize on it.
//
// Lifecycle per player id:
//   Absent → Connecting → Active → Closed (entry removed)
// Any phase may go straight to Closed on disconnect. The stale sweep is the
// backstop for connections that vanish without a disconnect notification.
//
// Lock order: never touch the map while holding a session lock. The sweep
// only try_locks sessions, so a session busy with a report is never removed
// out from under it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::{DetectionEvent, PlayerId, Position};

pub const MAX_TRUST: f32 = 100.0;
pub const MIN_TRUST: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Connecting,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateFlags {
    pub just_spawned: bool,
    pub in_vehicle:   bool,
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    pub player_id:         PlayerId,
    pub identifiers:       Vec<String>,
    pub phase:             SessionPhase,
    pub connected_at:      DateTime<Utc>,
    pub last_activity_at:  DateTime<Utc>,
    pub trust_score:       f32,
    pub warning_count:     u32,
    pub history:           VecDeque<DetectionEvent>,
    pub flags:             StateFlags,
    pub last_position:     Option<(Position, DateTime<Utc>)>,
    pub last_detection_at: Option<DateTime<Utc>>,
    history_capacity:      usize,
}

impl Session {
    pub fn new(player_id: PlayerId, now: DateTime<Utc>, history_capacity: usize) -> Self {
        Self {
            player_id,
            identifiers:       Vec::new(),
            phase:             SessionPhase::Connecting,
            connected_at:      now,
            last_activity_at:  now,
            trust_score:       MAX_TRUST,
            warning_count:     0,
            history:           VecDeque::with_capacity(history_capacity),
            flags:             StateFlags::default(),
            last_position:     None,
            last_detection_at: None,
            history_capacity:  history_capacity.max(1),
        }
    }

    pub fn is_active(&self) -> bool { self.phase == SessionPhase::Active }

    /// Subtract `severity` from trust, clamped to [0, 100]. Returns the new score.
    pub fn deduct(&mut self, severity: f32) -> f32 {
        self.trust_score = (self.trust_score - severity.max(0.0)).clamp(MIN_TRUST, MAX_TRUST);
        self.trust_score
    }

    /// Linear trust regeneration since the last scored detection.
    pub fn recover(&mut self, now: DateTime<Utc>, per_hour: f32) {
        if per_hour <= 0.0 { return; }
        if let Some(last) = self.last_detection_at {
            let hours = (now - last).num_milliseconds().max(0) as f32 / 3_600_000.0;
            self.trust_score = (self.trust_score + hours * per_hour).clamp(MIN_TRUST, MAX_TRUST);
        }
    }

    /// Append to the bounded history, evicting the oldest entry when full.
    pub fn record(&mut self, event: DetectionEvent) {
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.last_detection_at = Some(event.timestamp);
        self.history.push_back(event);
    }

    pub fn detections_of(&self, detection_type: &str) -> usize {
        self.history.iter().filter(|e| e.detection_type == detection_type).count()
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct SessionStore {
    sessions:             DashMap<PlayerId, SessionHandle>,
    history_capacity:     usize,
    pub total_created:    AtomicU64,
    pub total_swept:      AtomicU64,
}

impl SessionStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            sessions:         DashMap::new(),
            history_capacity,
            total_created:    AtomicU64::new(0),
            total_swept:      AtomicU64::new(0),
        }
    }

    /// Idempotent: the existing session if present, else a fresh Connecting one.
    pub fn get_or_create(&self, player_id: PlayerId, now: DateTime<Utc>) -> SessionHandle {
        self.sessions
            .entry(player_id)
            .or_insert_with(|| {
                self.total_created.fetch_add(1, Ordering::Relaxed);
                Arc::new(Mutex::new(Session::new(player_id, now, self.history_capacity)))
            })
            .value()
            .clone()
    }

    /// Connection accepted: create (or reuse) the session and record its identifiers.
    pub fn open(&self, player_id: PlayerId, identifiers: Vec<String>, now: DateTime<Utc>) -> SessionHandle {
        let handle = self.get_or_create(player_id, now);
        {
            let mut s = handle.lock();
            s.identifiers = identifiers;
            s.last_activity_at = now;
        }
        handle
    }

    /// Connecting → Active after the identity/ban check passed.
    pub fn activate(&self, player_id: PlayerId) -> bool {
        match self.get(player_id) {
            Some(h) => {
                h.lock().phase = SessionPhase::Active;
                info!(player_id, "Session active");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, player_id: PlayerId) -> Option<SessionHandle> {
        self.sessions.get(&player_id).map(|s| s.value().clone())
    }

    pub fn touch(&self, player_id: PlayerId, now: DateTime<Utc>) -> bool {
        match self.get(player_id) {
            Some(h) => { h.lock().last_activity_at = now; true }
            None => false,
        }
    }

    pub fn set_flags(&self, player_id: PlayerId, flags: StateFlags) -> bool {
        match self.get(player_id) {
            Some(h) => { h.lock().flags = flags; true }
            None => false,
        }
    }

    pub fn remove(&self, player_id: PlayerId) -> Option<SessionHandle> {
        let removed = self.sessions.remove(&player_id).map(|(_, s)| s);
        if removed.is_some() {
            debug!(player_id, "Session closed");
        }
        removed
    }

    /// Remove sessions whose connection is gone or that have been idle longer
    /// than `timeout`. Sessions locked by in-flight work are skipped and
    /// re-examined on the next sweep.
    pub fn sweep_stale<F>(&self, now: DateTime<Utc>, timeout: Duration, is_live: F) -> Vec<PlayerId>
    where
        F: Fn(PlayerId) -> bool,
    {
        let candidates: Vec<PlayerId> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut removed = Vec::new();

        for id in candidates {
            let gone = self.sessions.remove_if(&id, |_, handle| {
                match handle.try_lock() {
                    Some(s) => !is_live(id) || now - s.last_activity_at > timeout,
                    None    => false,
                }
            });
            if gone.is_some() {
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            self.total_swept.fetch_add(removed.len() as u64, Ordering::Relaxed);
            info!(count = removed.len(), "Swept stale sessions");
        }
        removed
    }

    pub fn active_players(&self) -> Vec<PlayerId> {
        self.sessions
            .iter()
            .filter(|e| e.value().try_lock().map(|s| s.is_active()).unwrap_or(true))
            .map(|e| *e.key())
            .collect()
    }

    pub fn len(&self) -> usize { self.sessions.len() }
    pub fn is_empty(&self) -> bool { self.sessions.is_empty() }
}
