// tripwire/src/auth/replay.rs
//
// Anti-replay cache: signature → expiry (unix seconds).
//
// DashMap shards the key space, so inserts for different signatures never
// contend, and `retain` locks one shard at a time, so the cleanup sweep can
// never interleave with an insert of the same key.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ReplayCache {
    entries: DashMap<String, i64>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Record `signature` as used until `expires_at`.
    ///
    /// Returns false if the signature is already live. Two concurrent calls
    /// with the same signature admit exactly one.
    pub fn try_insert(&self, signature: &str, expires_at: i64, now: i64) -> bool {
        match self.entries.entry(signature.to_string()) {
            Entry::Occupied(mut e) => {
                if *e.get() >= now {
                    return false;
                }
                // Expired but not yet swept; equivalent to absent.
                e.insert(expires_at);
                true
            }
            Entry::Vacant(v) => {
                v.insert(expires_at);
                true
            }
        }
    }

    pub fn is_live(&self, signature: &str, now: i64) -> bool {
        self.entries.get(signature).map(|e| *e >= now).unwrap_or(false)
    }

    pub fn expiry(&self, signature: &str) -> Option<i64> {
        self.entries.get(signature).map(|e| *e)
    }

    /// Drop entries past their expiry. Returns how many were removed.
    pub fn cleanup(&self, now: i64) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, expires_at| {
            let keep = *expires_at >= now;
            if !keep { removed += 1; }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn live_signature_rejected() {
        let cache = ReplayCache::new();
        assert!(cache.try_insert("aa", 1065, 1010));
        assert!(!cache.try_insert("aa", 1085, 1020));
        assert_eq!(cache.expiry("aa"), Some(1065));
    }

    #[test]
    fn expired_entry_can_be_reused_before_sweep() {
        let cache = ReplayCache::new();
        assert!(cache.try_insert("aa", 1065, 1010));
        assert!(cache.try_insert("aa", 1200, 1100));
        assert_eq!(cache.expiry("aa"), Some(1200));
    }

    #[test]
    fn cleanup_only_removes_expired() {
        let cache = ReplayCache::new();
        cache.try_insert("old", 1000, 900);
        cache.try_insert("new", 2000, 900);
        assert_eq!(cache.cleanup(1500), 1);
        assert!(!cache.is_live("old", 1500));
        assert!(cache.is_live("new", 1500));
        // Idempotent
        assert_eq!(cache.cleanup(1500), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_double_submit_admits_one() {
        let cache = Arc::new(ReplayCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&cache);
                std::thread::spawn(move || c.try_insert("dup", 5000, 1000))
            })
            .collect();
        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(admitted, 1);
    }
}
