// tripwire/src/ban_registry.rs
//
// In-memory deny-list keyed by stable identifier (license, steam, discord...).
// Warmed from the Datastore at startup; every new ban is written through the
// persistence queue. Lookups never touch storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::events::BanRecord;
use crate::persist::{PersistOp, PersistQueue};

pub struct BanRegistry {
    bans:    DashMap<String, BanRecord>,
    persist: Option<Arc<PersistQueue>>,
}

impl BanRegistry {
    pub fn new(persist: Option<Arc<PersistQueue>>) -> Self {
        Self { bans: DashMap::new(), persist }
    }

    /// Register a ban under each of its identifiers and queue it for storage.
    pub async fn ban(&self, record: BanRecord) {
        self.insert(&record);
        info!(
            player_id = ?record.player_id,
            identifiers = record.identifiers.len(),
            "BAN registered: {}", record.reason
        );
        if let Some(p) = &self.persist {
            p.enqueue(PersistOp::SaveBan(record)).await;
        }
    }

    fn insert(&self, record: &BanRecord) {
        for id in &record.identifiers {
            self.bans.insert(id.clone(), record.clone());
        }
    }

    /// First active ban matching any of `identifiers`.
    pub fn check(&self, identifiers: &[String], now: DateTime<Utc>) -> Option<BanRecord> {
        identifiers.iter().find_map(|id| {
            self.bans.get(id).filter(|b| b.is_active(now)).map(|b| b.value().clone())
        })
    }

    pub fn is_banned(&self, identifiers: &[String], now: DateTime<Utc>) -> bool {
        self.check(identifiers, now).is_some()
    }

    /// Warm the cache from stored records, skipping expired ones.
    pub fn load(&self, records: impl IntoIterator<Item = BanRecord>, now: DateTime<Utc>) -> usize {
        let mut n = 0;
        for r in records.into_iter().filter(|r| r.is_active(now)) {
            self.insert(&r);
            n += 1;
        }
        n
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.bans.len();
        self.bans.retain(|_, b| b.is_active(now));
        before.saturating_sub(self.bans.len())
    }

    pub fn len(&self) -> usize { self.bans.len() }
    pub fn is_empty(&self) -> bool { self.bans.is_empty() }
}
