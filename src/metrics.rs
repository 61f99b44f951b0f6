//! In-process observability primitives.
//!
//! Hand-rolled atomic counters and logarithmic-bucket histograms, the same
//! pattern used throughout the rest of this codebase's route-quality and
//! performance subsystems, rather than a metrics-facade crate: nothing here
//! needs an exporter, and every consumer (the Watcher, the gate) reads
//! these structures directly in-process.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logarithmic-bucket latency/duration histogram, microsecond resolution,
/// covering roughly 1us to 10s with ~10% relative error.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    buckets: Vec<u64>,
    count: u64,
    sum_us: u64,
    min_us: u64,
    max_us: u64,
}

static BUCKET_BOUNDS_US: &[u64] = &[
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000,
    200_000, 500_000, 1_000_000, 2_000_000, 5_000_000, 10_000_000, u64::MAX,
];

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HistogramInner {
                buckets: vec![0u64; BUCKET_BOUNDS_US.len()],
                count: 0,
                sum_us: 0,
                min_us: u64::MAX,
                max_us: 0,
            }),
        }
    }

    #[inline]
    pub fn record(&self, latency_us: u64) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        inner.sum_us = inner.sum_us.saturating_add(latency_us);
        inner.min_us = inner.min_us.min(latency_us);
        inner.max_us = inner.max_us.max(latency_us);
        let idx = BUCKET_BOUNDS_US.partition_point(|&bound| bound < latency_us);
        let bucket_idx = idx.min(inner.buckets.len() - 1);
        inner.buckets[bucket_idx] += 1;
    }

    #[inline]
    pub fn record_duration(&self, duration: std::time::Duration) {
        self.record(duration.as_micros() as u64);
    }

    #[inline]
    pub fn record_millis(&self, latency_ms: f64) {
        self.record((latency_ms * 1000.0).max(0.0) as u64);
    }

    /// Percentile value, in milliseconds (the unit every KPI in spec §4.4
    /// is expressed in).
    pub fn percentile_ms(&self, p: f64) -> f64 {
        let inner = self.inner.lock();
        if inner.count == 0 {
            return 0.0;
        }
        let target = ((p / 100.0) * inner.count as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &bucket_count) in inner.buckets.iter().enumerate() {
            cumulative += bucket_count;
            if cumulative >= target {
                return BUCKET_BOUNDS_US[i] as f64 / 1000.0;
            }
        }
        inner.max_us as f64 / 1000.0
    }

    pub fn p95_ms(&self) -> f64 {
        self.percentile_ms(95.0)
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    pub fn mean_ms(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.count == 0 {
            0.0
        } else {
            (inner.sum_us as f64 / inner.count as f64) / 1000.0
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buckets.iter_mut().for_each(|b| *b = 0);
        inner.count = 0;
        inner.sum_us = 0;
        inner.min_us = u64::MAX;
        inner.max_us = 0;
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count(),
            mean_ms: self.mean_ms(),
            p50_ms: self.percentile_ms(50.0),
            p95_ms: self.percentile_ms(95.0),
            p99_ms: self.percentile_ms(99.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Stage names sampled by the Tick Orchestrator (spec §4.3 "Observable
/// outputs per tick").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    TickTotal,
    FetchMd,
    Guards,
    Emit,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::TickTotal => "tick_total",
            Stage::FetchMd => "fetch_md",
            Stage::Guards => "guards",
            Stage::Emit => "emit",
        }
    }
}

/// The metric registry for one engine process. Lock-free counters, mutex
/// protected histograms; this is the one legitimate process-wide singleton
/// the engine carries (spec §9), and it exposes [`MetricsRegistry::reset`]
/// as the explicit teardown hook for tests.
#[derive(Debug)]
pub struct MetricsRegistry {
    stage_histograms: HashMap<Stage, LatencyHistogram>,
    coalesced_commands: HashMap<&'static str, AtomicU64>,
    deadline_misses: AtomicU64,
    guard_trips: Mutex<HashMap<String, u64>>,
    writes_failed: AtomicU64,
    numeric_domain_drops: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut stage_histograms = HashMap::new();
        for stage in [Stage::TickTotal, Stage::FetchMd, Stage::Guards, Stage::Emit] {
            stage_histograms.insert(stage, LatencyHistogram::new());
        }
        let mut coalesced_commands = HashMap::new();
        for op in ["place", "cancel"] {
            coalesced_commands.insert(op, AtomicU64::new(0));
        }
        Self {
            stage_histograms,
            coalesced_commands,
            deadline_misses: AtomicU64::new(0),
            guard_trips: Mutex::new(HashMap::new()),
            writes_failed: AtomicU64::new(0),
            numeric_domain_drops: AtomicU64::new(0),
        }
    }

    pub fn stage(&self, stage: Stage) -> &LatencyHistogram {
        self.stage_histograms
            .get(&stage)
            .expect("all Stage variants are registered at construction")
    }

    pub fn record_coalesced(&self, op: &'static str, count: u64) {
        if let Some(counter) = self.coalesced_commands.get(op) {
            counter.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_deadline_miss(&self) {
        self.deadline_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deadline_misses_total(&self) -> u64 {
        self.deadline_misses.load(Ordering::Relaxed)
    }

    pub fn record_guard_trip(&self, reason: &str) {
        *self.guard_trips.lock().entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_write_failed(&self) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn writes_failed_total(&self) -> u64 {
        self.writes_failed.load(Ordering::Relaxed)
    }

    /// A NaN/Inf sample was dropped somewhere in the KPI path (spec §7
    /// `NumericDomain`): the entry is skipped, the iteration continues.
    pub fn record_numeric_domain_drop(&self) {
        self.numeric_domain_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn numeric_domain_drops_total(&self) -> u64 {
        self.numeric_domain_drops.load(Ordering::Relaxed)
    }

    /// Teardown hook: resets every counter/histogram in place. Called
    /// between unit tests that share a registry, and at process exit.
    pub fn reset(&self) {
        for hist in self.stage_histograms.values() {
            hist.reset();
        }
        for counter in self.coalesced_commands.values() {
            counter.store(0, Ordering::Relaxed);
        }
        self.deadline_misses.store(0, Ordering::Relaxed);
        self.guard_trips.lock().clear();
        self.writes_failed.store(0, Ordering::Relaxed);
        self.numeric_domain_drops.store(0, Ordering::Relaxed);
    }
}
