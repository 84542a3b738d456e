// tripwire/src/persist.rs
//
// Bounded persistence queue between the scoring path and the Datastore.
//
// Enqueue never waits on storage: ops land in an in-memory VecDeque and a
// background flush loop drains it. When the queue is full the oldest op is
// dropped with a warning (back-pressure). Datastore failures are logged and
// counted; they never feed back into a decision already made.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collab::Datastore;
use crate::config::PersistenceConfig;
use crate::events::{BanRecord, DetectionRecord};

#[derive(Debug, Clone)]
pub enum PersistOp {
    SaveBan(BanRecord),
    AppendDetection(DetectionRecord),
}

pub struct PersistQueue {
    store:          Arc<dyn Datastore>,
    queue:          Mutex<VecDeque<PersistOp>>,
    max_queue:      usize,
    flush_interval: Duration,
    pub written:    AtomicU64,
    pub dropped:    AtomicU64,
    pub failed:     AtomicU64,
}

impl PersistQueue {
    pub fn new(store: Arc<dyn Datastore>, cfg: &PersistenceConfig) -> Arc<Self> {
        info!("Persistence queue configured, depth={}", cfg.max_queue);
        Arc::new(Self {
            store,
            queue:          Mutex::new(VecDeque::new()),
            max_queue:      cfg.max_queue.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms.max(1)),
            written:        AtomicU64::new(0),
            dropped:        AtomicU64::new(0),
            failed:         AtomicU64::new(0),
        })
    }

    pub async fn enqueue(&self, op: PersistOp) {
        let mut q = self.queue.lock().await;
        if q.len() >= self.max_queue {
            q.pop_front(); // drop oldest
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Persistence queue full, dropped oldest op");
        }
        q.push_back(op);
    }

    pub async fn depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain the queue once and write every op. Returns how many were written.
    pub async fn flush(&self) -> usize {
        let batch: Vec<PersistOp> = {
            let mut q = self.queue.lock().await;
            q.drain(..).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut ok = 0usize;
        for op in &batch {
            let res = match op {
                PersistOp::SaveBan(r)         => self.store.save_ban(r).await,
                PersistOp::AppendDetection(r) => self.store.append_detection_history(r).await,
            };
            match res {
                Ok(()) => ok += 1,
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("persist failed: {:#}", e);
                }
            }
        }
        self.written.fetch_add(ok as u64, Ordering::Relaxed);
        debug!(written = ok, batch = batch.len(), "persistence flush");
        ok
    }

    pub async fn flush_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.flush_interval).await;
            self.flush().await;
        }
    }
}
