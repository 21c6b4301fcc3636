//! Progress counters shared between the mark/sweep phases and a background reporter task,
//! so `tracing` events can report rates (repos/s, manifests/s, blobs/s) rather than just
//! cumulative totals, at `info!` level, without leaning on an external metrics system this
//! crate doesn't carry.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct ProgressCounters {
    repositories_marked: AtomicU64,
    manifests_marked: AtomicU64,
    blobs_deleted: AtomicU64,
    manifests_deleted: AtomicU64,
}

impl ProgressCounters {
    pub fn add_repository(&self, manifests: u64) {
        self.repositories_marked.fetch_add(1, Ordering::Relaxed);
        self.manifests_marked.fetch_add(manifests, Ordering::Relaxed);
    }

    pub fn add_blob_deleted(&self) {
        self.blobs_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_manifest_deleted(&self) {
        self.manifests_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.repositories_marked.load(Ordering::Relaxed),
            self.manifests_marked.load(Ordering::Relaxed),
            self.blobs_deleted.load(Ordering::Relaxed),
            self.manifests_deleted.load(Ordering::Relaxed),
        )
    }
}

/// Runs until `cancel` fires, logging cumulative counts and the rate since the previous tick
/// at `interval`.
pub async fn report(counters: std::sync::Arc<ProgressCounters>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; establish the baseline instead
    let mut last = counters.snapshot();
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_at).as_secs_f64().max(f64::EPSILON);
        let current = counters.snapshot();

        tracing::info!(
            repos_per_sec = (current.0 - last.0) as f64 / elapsed,
            manifests_per_sec = (current.1 - last.1) as f64 / elapsed,
            blobs_deleted_per_sec = (current.2 - last.2) as f64 / elapsed,
            repositories_marked = current.0,
            manifests_marked = current.1,
            blobs_deleted = current.2,
            manifests_deleted = current.3,
            "garbage collection progress",
        );

        last = current;
        last_at = now;
    }
}
