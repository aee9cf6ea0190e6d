use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => {
                self.buckets[idx].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Latency of the player-facing endpoints.
#[derive(Default)]
pub struct HttpMetrics {
    get_data: LatencyMetrics,
    save_data: LatencyMetrics,
    top_players: LatencyMetrics,
    global_stats: LatencyMetrics,
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub get_data: LatencySnapshot,
    pub save_data: LatencySnapshot,
    pub top_players: LatencySnapshot,
    pub global_stats: LatencySnapshot,
}

impl HttpMetrics {
    pub fn record_get_data(&self, duration: Duration) {
        self.get_data.record(duration);
    }

    pub fn record_save_data(&self, duration: Duration) {
        self.save_data.record(duration);
    }

    pub fn record_top_players(&self, duration: Duration) {
        self.top_players.record(duration);
    }

    pub fn record_global_stats(&self, duration: Duration) {
        self.global_stats.record(duration);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            get_data: self.get_data.snapshot(),
            save_data: self.save_data.snapshot(),
            top_players: self.top_players.snapshot(),
            global_stats: self.global_stats.snapshot(),
        }
    }
}

/// Counters for the progress store.
#[derive(Default)]
pub struct StoreMetrics {
    records_created: AtomicU64,
    records_saved: AtomicU64,
    records_evicted: AtomicU64,
    corrupt_skipped: AtomicU64,
    corrupt_recreated: AtomicU64,
    write_errors: AtomicU64,
    resets: AtomicU64,
    records_reset: AtomicU64,
    wipes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreMetricsSnapshot {
    pub records_created: u64,
    pub records_saved: u64,
    pub records_evicted: u64,
    pub corrupt_skipped: u64,
    pub corrupt_recreated: u64,
    pub write_errors: u64,
    pub resets: u64,
    pub records_reset: u64,
    pub wipes: u64,
}

impl StoreMetrics {
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            records_created: self.records_created.load(Ordering::Relaxed),
            records_saved: self.records_saved.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
            corrupt_skipped: self.corrupt_skipped.load(Ordering::Relaxed),
            corrupt_recreated: self.corrupt_recreated.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            records_reset: self.records_reset.load(Ordering::Relaxed),
            wipes: self.wipes.load(Ordering::Relaxed),
        }
    }

    pub fn inc_created(&self) {
        self.records_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_saved(&self) {
        self.records_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evicted(&self, count: u64) {
        self.records_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_corrupt_skipped(&self) {
        self.corrupt_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_corrupt_recreated(&self) {
        self.corrupt_recreated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self, records: u64) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        self.records_reset.fetch_add(records, Ordering::Relaxed);
    }

    pub fn inc_wipe(&self) {
        self.wipes.fetch_add(1, Ordering::Relaxed);
    }
}
