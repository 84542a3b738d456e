// tripwire/src/engine/resources.rs
//
// Running-resource policy for ResourceCheck frames.
//
// Deny-list mode: Aho-Corasick automaton over every entry, case-insensitive
// substring match, O(n) per resource name regardless of list size.
// Allow-list mode: exact (case-insensitive) membership; anything else is flagged.

use std::collections::HashSet;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use serde_json::json;

use crate::config::{ResourceConfig, ResourceMode};
use crate::error::ConfigError;
use crate::events::Payload;

pub const RESOURCE_MISMATCH: &str = "resource_mismatch";

enum Matcher {
    Deny { ac: AhoCorasick, patterns: Vec<String> },
    Allow(HashSet<String>),
}

pub struct ResourcePolicy {
    matcher: Matcher,
}

impl ResourcePolicy {
    pub fn from_config(cfg: &ResourceConfig) -> Result<Self, ConfigError> {
        let entries: Vec<String> = cfg.entries.iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        let matcher = match cfg.mode {
            ResourceMode::DenyList => {
                let ac = AhoCorasickBuilder::new()
                    .ascii_case_insensitive(true)
                    .match_kind(MatchKind::LeftmostFirst)
                    .build(&entries)
                    .map_err(|e| ConfigError::Invalid(format!("resource deny-list: {}", e)))?;
                Matcher::Deny { ac, patterns: entries }
            }
            ResourceMode::AllowList => Matcher::Allow(entries.into_iter().collect()),
        };
        Ok(Self { matcher })
    }

    /// Resources that violate the policy. Empty means the check is clean.
    pub fn violations(&self, running: &[String]) -> Vec<String> {
        running.iter()
            .filter(|name| match &self.matcher {
                Matcher::Deny { ac, patterns } => !patterns.is_empty() && ac.is_match(name.as_str()),
                Matcher::Allow(allowed) => !allowed.contains(&name.trim().to_ascii_lowercase()),
            })
            .cloned()
            .collect()
    }

    /// Payload for the synthetic `resource_mismatch` detection.
    pub fn mismatch_payload(&self, running: &[String], violations: &[String]) -> Payload {
        let mut payload = Payload::new();
        payload.insert("violations".into(), json!(violations));
        payload.insert("running_count".into(), json!(running.len()));
        if let Matcher::Deny { ac, patterns } = &self.matcher {
            let matched: HashSet<&str> = violations.iter()
                .flat_map(|v| ac.find_iter(v.as_str()).map(|m| patterns[m.pattern().as_usize()].as_str()))
                .collect();
            let mut matched: Vec<&str> = matched.into_iter().collect();
            matched.sort_unstable();
            payload.insert("matched_patterns".into(), json!(matched));
        }
        payload
    }
}
