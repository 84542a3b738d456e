// tripwire/src/auth/token.rs
//
// TokenAuthority: issues and validates short-lived signed report tokens.
//
// Signing: HMAC-SHA256 over
//     player_id (u64 BE) || issued_at (i64 BE) || nonce bytes
// With an empty nonce the MAC input is exactly player_id || issued_at.
//
// Validation order:
//   1. structure   — 32-byte hex signature, positive issued_at, bounded nonce
//   2. window      — |now - issued_at| <= validity window, both directions
//   3. signature   — recomputed over the server-known player id, constant time
//   4. replay      — signature must not be live in the replay cache
//
// The authority never bans or disconnects; it only answers. The processor
// decides what a rejection means.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, error, info};

use crate::auth::replay::ReplayCache;
use crate::config::TokenConfig;
use crate::error::{TokenError, TokenRejection};
use crate::events::{PlayerId, Token};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_BYTES: usize = 32;
pub const MAX_NONCE_BYTES: usize = 128;

/// Secrets shipped in sample configs. Signing with one of these is worse than
/// not signing at all, so they disable the authority.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change_me",
    "change-me",
    "secret",
    "default",
    "placeholder",
    "your-secret-here",
];

pub fn is_placeholder_secret(secret: &[u8]) -> bool {
    match std::str::from_utf8(secret) {
        Ok(s) => {
            let s = s.trim();
            s.is_empty() || PLACEHOLDER_SECRETS.iter().any(|p| s.eq_ignore_ascii_case(p))
        }
        Err(_) => secret.is_empty(),
    }
}

pub struct TokenAuthority {
    key:             Option<Vec<u8>>,  // None = disabled
    validity_window: i64,
    replay_buffer:   i64,
    replay:          ReplayCache,
    rolling_nonce:   AtomicU64,
    reported_fatal:  AtomicBool,
}

impl TokenAuthority {
    pub fn new(secret: Option<&[u8]>, config: &TokenConfig) -> Self {
        let key = secret.filter(|s| !is_placeholder_secret(s)).map(|s| s.to_vec());
        let authority = Self {
            key,
            validity_window: config.validity_window_secs,
            replay_buffer:   config.replay_buffer_secs,
            replay:          ReplayCache::new(),
            rolling_nonce:   AtomicU64::new(1),
            reported_fatal:  AtomicBool::new(false),
        };
        if authority.is_enabled() {
            info!(window_secs = authority.validity_window, "Token authority ready");
        } else {
            authority.report_fatal();
        }
        authority
    }

    pub fn is_enabled(&self) -> bool { self.key.is_some() }
    pub fn validity_window(&self) -> i64 { self.validity_window }

    fn report_fatal(&self) {
        if !self.reported_fatal.swap(true, Ordering::Relaxed) {
            error!(
                "Signing secret unset or placeholder: token handshake DISABLED. \
                 Set TRIPWIRE_SECRET to a real secret; reports cannot be authenticated until then."
            );
        }
    }

    fn mac(&self, player_id: PlayerId, issued_at: i64, nonce: &str) -> Option<HmacSha256> {
        let key = self.key.as_deref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(&u64::from(player_id).to_be_bytes());
        mac.update(&issued_at.to_be_bytes());
        mac.update(nonce.as_bytes());
        Some(mac)
    }

    // ── Issuance ──────────────────────────────────────────────────────────────

    pub fn issue_token(&self, player_id: PlayerId) -> Result<Token, TokenError> {
        self.issue_token_at(player_id, Utc::now().timestamp())
    }

    pub fn issue_token_at(&self, player_id: PlayerId, now: i64) -> Result<Token, TokenError> {
        self.issue_bound_token_at(player_id, "", now)
    }

    /// Token bound to an explicit nonce (handshake client nonce).
    pub fn issue_bound_token_at(&self, player_id: PlayerId, nonce: &str, now: i64) -> Result<Token, TokenError> {
        let mac = match self.mac(player_id, now, nonce) {
            Some(m) => m,
            None => {
                self.report_fatal();
                return Err(TokenError::SecretUnavailable);
            }
        };
        Ok(Token {
            player_id,
            issued_at: now,
            nonce:     nonce.to_string(),
            signature: hex::encode(mac.finalize().into_bytes()),
        })
    }

    /// Next token in a connection's chain. Every accepted report consumes its
    /// token, so the ack carries a fresh one; the counter nonce keeps two
    /// tokens issued within the same second distinct.
    pub fn next_token_at(&self, player_id: PlayerId, now: i64) -> Result<Token, TokenError> {
        let n = self.rolling_nonce.fetch_add(1, Ordering::Relaxed);
        self.issue_bound_token_at(player_id, &format!("r{:x}", n), now)
    }

    // ── Validation ────────────────────────────────────────────────────────────

    pub fn validate(&self, player_id: PlayerId, token: &Token) -> Result<(), TokenRejection> {
        self.validate_at(player_id, token, Utc::now().timestamp())
    }

    pub fn is_valid(&self, player_id: PlayerId, token: &Token, now: i64) -> bool {
        self.validate_at(player_id, token, now).is_ok()
    }

    pub fn validate_at(&self, player_id: PlayerId, token: &Token, now: i64) -> Result<(), TokenRejection> {
        // 1. Structure
        let sig = match hex::decode(token.signature.trim()) {
            Ok(b) if b.len() == SIGNATURE_BYTES => b,
            _ => return Err(TokenRejection::Malformed),
        };
        if token.issued_at <= 0 || token.nonce.len() > MAX_NONCE_BYTES {
            return Err(TokenRejection::Malformed);
        }

        // 2. Window
        let age = now.saturating_sub(token.issued_at);
        if age > self.validity_window {
            return Err(TokenRejection::Expired);
        }
        if age < -self.validity_window {
            return Err(TokenRejection::FromFuture);
        }

        // 3. Signature
        let mac = self.mac(player_id, token.issued_at, &token.nonce)
            .ok_or(TokenRejection::Unverifiable)?;
        if mac.verify_slice(&sig).is_err() {
            return Err(TokenRejection::BadSignature);
        }

        // 4. Replay. Keyed on the canonical encoding so case games on the hex
        // string cannot mint a second key for the same signature.
        let key = hex::encode(&sig);
        let expires_at = token.issued_at + self.validity_window + self.replay_buffer;
        if !self.replay.try_insert(&key, expires_at, now) {
            return Err(TokenRejection::Replayed);
        }
        Ok(())
    }

    // ── Replay cache maintenance ──────────────────────────────────────────────

    pub fn cleanup_replay_cache(&self, now: i64) -> usize {
        self.replay.cleanup(now)
    }

    pub fn replay_expiry(&self, signature: &str) -> Option<i64> {
        self.replay.expiry(&signature.to_ascii_lowercase())
    }

    pub fn replay_cache_len(&self) -> usize { self.replay.len() }

    pub async fn cleanup_loop(self: Arc<Self>, every: Duration) {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let removed = self.cleanup_replay_cache(Utc::now().timestamp());
            if removed > 0 {
                debug!(removed, remaining = self.replay.len(), "Replay cache swept");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(secret: &str) -> TokenAuthority {
        TokenAuthority::new(Some(secret.as_bytes()), &TokenConfig::default())
    }

    #[test]
    fn placeholder_secrets_disable_issuance() {
        for s in ["", "   ", "changeme", "CHANGE_ME", "secret"] {
            let a = authority(s);
            assert!(!a.is_enabled(), "{:?} should be refused", s);
            assert_eq!(a.issue_token_at(1, 1000), Err(TokenError::SecretUnavailable));
        }
        let none = TokenAuthority::new(None, &TokenConfig::default());
        assert_eq!(none.issue_token_at(1, 1000), Err(TokenError::SecretUnavailable));
    }

    #[test]
    fn disabled_authority_cannot_verify() {
        let good = authority("k").issue_token_at(42, 1000).unwrap();
        let disabled = authority("changeme");
        assert_eq!(disabled.validate_at(42, &good, 1010), Err(TokenRejection::Unverifiable));
    }

    #[test]
    fn window_is_symmetric() {
        let a = authority("k");
        let t = a.issue_token_at(42, 1000).unwrap();
        assert!(a.is_valid(42, &t, 1030));

        let t = a.issue_token_at(42, 1000).unwrap();
        let a2 = authority("k");
        assert_eq!(a2.validate_at(42, &t, 1061), Err(TokenRejection::Expired));
        assert_eq!(a2.validate_at(42, &t, 939), Err(TokenRejection::FromFuture));
        // Boundary is inclusive
        assert!(a2.is_valid(42, &t, 1060));
    }

    #[test]
    fn replay_within_window_rejected() {
        let a = authority("k");
        let t = a.issue_token_at(42, 1000).unwrap();
        assert!(a.is_valid(42, &t, 1010));
        assert_eq!(a.replay_expiry(&t.signature), Some(1065));
        assert_eq!(a.validate_at(42, &t, 1020), Err(TokenRejection::Replayed));
    }

    #[test]
    fn uppercase_hex_does_not_bypass_replay_cache() {
        let a = authority("k");
        let t = a.issue_token_at(42, 1000).unwrap();
        assert!(a.is_valid(42, &t, 1001));
        let mut shouted = t.clone();
        shouted.signature = t.signature.to_ascii_uppercase();
        assert_eq!(a.validate_at(42, &shouted, 1002), Err(TokenRejection::Replayed));
    }

    #[test]
    fn signature_binds_player_time_and_nonce() {
        let a = authority("k");
        let t = a.issue_bound_token_at(42, "n1", 1000).unwrap();

        assert_eq!(a.validate_at(43, &t, 1001), Err(TokenRejection::BadSignature));

        let mut moved = t.clone();
        moved.issued_at = 1001;
        assert_eq!(a.validate_at(42, &moved, 1001), Err(TokenRejection::BadSignature));

        let mut renonced = t.clone();
        renonced.nonce = "n2".into();
        assert_eq!(a.validate_at(42, &renonced, 1001), Err(TokenRejection::BadSignature));

        let mut flipped = t.clone();
        let mut bytes = hex::decode(&flipped.signature).unwrap();
        bytes[0] ^= 0x01;
        flipped.signature = hex::encode(bytes);
        assert_eq!(a.validate_at(42, &flipped, 1001), Err(TokenRejection::BadSignature));

        assert!(a.is_valid(42, &t, 1001));
    }

    #[test]
    fn different_secret_rejects() {
        let t = authority("k").issue_token_at(42, 1000).unwrap();
        assert_eq!(authority("other").validate_at(42, &t, 1001), Err(TokenRejection::BadSignature));
    }

    #[test]
    fn malformed_tokens() {
        let a = authority("k");
        let good = a.issue_token_at(42, 1000).unwrap();

        let mut short = good.clone();
        short.signature = "abcd".into();
        assert_eq!(a.validate_at(42, &short, 1000), Err(TokenRejection::Malformed));

        let mut not_hex = good.clone();
        not_hex.signature = "zz".repeat(32);
        assert_eq!(a.validate_at(42, &not_hex, 1000), Err(TokenRejection::Malformed));

        let mut zero = good.clone();
        zero.issued_at = 0;
        assert_eq!(a.validate_at(42, &zero, 1000), Err(TokenRejection::Malformed));
    }

    #[test]
    fn rolling_tokens_in_same_second_are_distinct() {
        let a = authority("k");
        let t1 = a.next_token_at(7, 1000).unwrap();
        let t2 = a.next_token_at(7, 1000).unwrap();
        assert_ne!(t1.signature, t2.signature);
        assert!(a.is_valid(7, &t1, 1000));
        assert!(a.is_valid(7, &t2, 1000));
    }

    #[test]
    fn end_to_end_issue_validate_replay_reissue() {
        let a = authority("k");
        let t = a.issue_token_at(42, 1000).unwrap();
        assert_eq!(t.issued_at, 1000);
        assert!(a.is_valid(42, &t, 1010));
        assert_eq!(a.replay_expiry(&t.signature), Some(1065));
        assert!(!a.is_valid(42, &t, 1020));

        let t2 = a.issue_token_at(42, 1020).unwrap();
        assert_ne!(t.signature, t2.signature);
        assert!(a.is_valid(42, &t2, 1020));
    }

    #[test]
    fn cleanup_drops_only_expired() {
        let a = authority("k");
        let t = a.issue_token_at(1, 1000).unwrap();
        assert!(a.is_valid(1, &t, 1000));
        assert_eq!(a.cleanup_replay_cache(1065), 0);
        assert_eq!(a.cleanup_replay_cache(1066), 1);
        assert_eq!(a.replay_cache_len(), 0);
    }
}
