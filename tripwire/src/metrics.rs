// tripwire/src/metrics.rs
//
// Operational metrics in Prometheus text exposition format.
//
//   tripwire_frames_total                  Counter — client frames decoded
//   tripwire_frames_rejected_total         Counter — frames that failed to decode
//   tripwire_connections_total             Counter — accepted connections
//   tripwire_reports_total                 Counter — detections scored
//   tripwire_reports_ignored_total         Counter — detections with no active session
//   tripwire_token_rejections_total        Counter — invalid / replayed tokens
//   tripwire_token_unverifiable_total      Counter — reports refused while signing is disabled
//   tripwire_corroborated_total            Counter — client claims confirmed by ground truth
//   tripwire_actions_total{action}         Counter — executed actions by kind
//   tripwire_persist_{written,dropped,failed}_total
//   tripwire_sessions_active               Gauge
//   tripwire_replay_cache_entries          Gauge
//   tripwire_bans_cached                   Gauge
//
// Endpoint: GET /metrics on a bare TcpListener (default 127.0.0.1:9092).

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::info;

use crate::ban_registry::BanRegistry;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::processor::DetectionProcessor;
use crate::events::ActionKind;
use crate::persist::PersistQueue;

const ACTIONS: [ActionKind; 5] = [
    ActionKind::Ignore, ActionKind::Allow, ActionKind::Warn, ActionKind::Kick, ActionKind::Ban,
];

pub struct TripwireMetrics {
    pub frames:          AtomicU64,
    pub frames_rejected: AtomicU64,
    pub connections:     AtomicU64,
    processor:           Arc<DetectionProcessor>,
    dispatcher:          Arc<Dispatcher>,
    bans:                Arc<BanRegistry>,
    persist:             Option<Arc<PersistQueue>>,
}

impl TripwireMetrics {
    pub fn new(
        processor:  Arc<DetectionProcessor>,
        dispatcher: Arc<Dispatcher>,
        bans:       Arc<BanRegistry>,
        persist:    Option<Arc<PersistQueue>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            frames:          AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            connections:     AtomicU64::new(0),
            processor,
            dispatcher,
            bans,
            persist,
        })
    }

    pub fn record_frame(&self) { self.frames.fetch_add(1, Ordering::Relaxed); }
    pub fn record_bad_frame(&self) { self.frames_rejected.fetch_add(1, Ordering::Relaxed); }
    pub fn record_connection(&self) { self.connections.fetch_add(1, Ordering::Relaxed); }

    pub fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(2048);

        macro_rules! metric {
            ($kind:expr, $name:expr, $help:expr, $val:expr) => {
                let _ = write!(out, "# HELP {0} {1}\n# TYPE {0} {2}\n{0} {3}\n", $name, $help, $kind, $val);
            };
        }

        let stats = &self.processor.stats;
        metric!("counter", "tripwire_frames_total", "Client frames decoded", self.frames.load(Ordering::Relaxed));
        metric!("counter", "tripwire_frames_rejected_total", "Client frames that failed to decode", self.frames_rejected.load(Ordering::Relaxed));
        metric!("counter", "tripwire_connections_total", "Accepted client connections", self.connections.load(Ordering::Relaxed));
        metric!("counter", "tripwire_reports_total", "Detections scored", stats.processed.load(Ordering::Relaxed));
        metric!("counter", "tripwire_reports_ignored_total", "Detections with no active session", stats.ignored.load(Ordering::Relaxed));
        metric!("counter", "tripwire_token_rejections_total", "Invalid or replayed tokens", stats.token_rejected.load(Ordering::Relaxed));
        metric!("counter", "tripwire_token_unverifiable_total", "Reports refused while signing is disabled", stats.unverifiable.load(Ordering::Relaxed));
        metric!("counter", "tripwire_corroborated_total", "Client claims confirmed by ground truth", stats.corroborated.load(Ordering::Relaxed));

        out.push_str("# HELP tripwire_actions_total Executed actions by kind\n");
        out.push_str("# TYPE tripwire_actions_total counter\n");
        for action in ACTIONS {
            let _ = writeln!(
                out,
                "tripwire_actions_total{{action=\"{}\"}} {}",
                action.to_string().to_ascii_lowercase(),
                self.dispatcher.executed(action)
            );
        }

        if let Some(p) = &self.persist {
            metric!("counter", "tripwire_persist_written_total", "Records written to the datastore", p.written.load(Ordering::Relaxed));
            metric!("counter", "tripwire_persist_dropped_total", "Records dropped on a full queue", p.dropped.load(Ordering::Relaxed));
            metric!("counter", "tripwire_persist_failed_total", "Datastore write failures", p.failed.load(Ordering::Relaxed));
        }

        metric!("gauge", "tripwire_sessions_active", "Sessions in the store", self.processor.sessions().len());
        metric!("gauge", "tripwire_replay_cache_entries", "Live entries in the replay cache", self.processor.tokens().replay_cache_len());
        metric!("gauge", "tripwire_bans_cached", "Identifiers in the ban cache", self.bans.len());

        out
    }
}

// ── HTTP /metrics endpoint ────────────────────────────────────────────────────

pub async fn serve(metrics: Arc<TripwireMetrics>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("/metrics endpoint listening on {}", addr);

    loop {
        let (mut stream, _) = listener.accept().await?;
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let body = metrics.prometheus_text();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(), body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
