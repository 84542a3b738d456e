// tripwire/src/lib.rs
//
// Tripwire: server-authoritative anti-cheat.
//
//   client  ──frames──▶  server  ──▶  processor  ──▶  dispatcher
//   (detector tasks,      (ingress,    (token check,    (ban registry,
//    adaptive scheduler,   handshake)   trust scoring)   persistence, notify)
//    token-holding agent)

pub mod auth;
pub mod ban_registry;
pub mod client;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod persist;
pub mod replay;
pub mod server;
pub mod state;
pub mod wire;
