//! Process-wide metrics: per-method counters and latency sampling.
//!
//! A single mutex guards all counters plus per-method duration rings capped
//! at 1000 samples (drop-oldest). Snapshots are cheap enough to log on a
//! timer; percentile math runs on the snapshot copy, not under the lock.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Ring capacity per method
const MAX_SAMPLES: usize = 1000;

#[derive(Default)]
struct MethodStats {
    created: u64,
    succeeded: u64,
    failed: u64,
    callbacks: u64,
    replays_rejected: u64,
    latencies_ms: VecDeque<u64>,
}

#[derive(Default)]
struct MetricsInner {
    methods: FxHashMap<String, MethodStats>,
    lock_acquired: u64,
    lock_busy: u64,
    events_dispatched: u64,
    events_dead_lettered: u64,
}

/// Snapshot of one method's counters and latency percentiles.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MethodSnapshot {
    pub method: String,
    pub created: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub callbacks: u64,
    pub replays_rejected: u64,
    pub samples: usize,
    pub avg_ms: Option<u64>,
    pub p50_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub methods: Vec<MethodSnapshot>,
    pub lock_acquired: u64,
    pub lock_busy: u64,
    /// Fraction of lock attempts that succeeded first try
    pub lock_hit_rate: Option<f64>,
    pub events_dispatched: u64,
    pub events_dead_lettered: u64,
}

pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    fn with_method<F: FnOnce(&mut MethodStats)>(&self, method: &str, f: F) {
        let mut inner = self.inner.lock().unwrap();
        f(inner.methods.entry(method.to_string()).or_default());
    }

    pub fn record_create(&self, method: &str, latency_ms: u64) {
        self.with_method(method, |stats| {
            stats.created += 1;
            if stats.latencies_ms.len() >= MAX_SAMPLES {
                stats.latencies_ms.pop_front();
            }
            stats.latencies_ms.push_back(latency_ms);
        });
    }

    pub fn record_success(&self, method: &str) {
        self.with_method(method, |stats| stats.succeeded += 1);
    }

    pub fn record_failure(&self, method: &str) {
        self.with_method(method, |stats| stats.failed += 1);
    }

    pub fn record_callback(&self, method: &str) {
        self.with_method(method, |stats| stats.callbacks += 1);
    }

    pub fn record_replay_rejected(&self, method: &str) {
        self.with_method(method, |stats| stats.replays_rejected += 1);
    }

    pub fn record_lock(&self, acquired: bool) {
        let mut inner = self.inner.lock().unwrap();
        if acquired {
            inner.lock_acquired += 1;
        } else {
            inner.lock_busy += 1;
        }
    }

    pub fn record_dispatch(&self) {
        self.inner.lock().unwrap().events_dispatched += 1;
    }

    pub fn record_dead_letter(&self) {
        self.inner.lock().unwrap().events_dead_lettered += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();

        let mut methods: Vec<MethodSnapshot> = inner
            .methods
            .iter()
            .map(|(method, stats)| {
                let mut sorted: Vec<u64> = stats.latencies_ms.iter().copied().collect();
                sorted.sort_unstable();
                MethodSnapshot {
                    method: method.clone(),
                    created: stats.created,
                    succeeded: stats.succeeded,
                    failed: stats.failed,
                    callbacks: stats.callbacks,
                    replays_rejected: stats.replays_rejected,
                    samples: sorted.len(),
                    avg_ms: if sorted.is_empty() {
                        None
                    } else {
                        Some(sorted.iter().sum::<u64>() / sorted.len() as u64)
                    },
                    p50_ms: percentile(&sorted, 50.0),
                    p99_ms: percentile(&sorted, 99.0),
                }
            })
            .collect();
        methods.sort_by(|a, b| a.method.cmp(&b.method));

        let attempts = inner.lock_acquired + inner.lock_busy;
        MetricsSnapshot {
            methods,
            lock_acquired: inner.lock_acquired,
            lock_busy: inner.lock_busy,
            lock_hit_rate: if attempts == 0 {
                None
            } else {
                Some(inner.lock_acquired as f64 / attempts as f64)
            },
            events_dispatched: inner.events_dispatched,
            events_dead_lettered: inner.events_dead_lettered,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile over pre-sorted samples, e.g. 50.0 for median, 99.0 for P99.
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}
