//! KPI Gate (spec §4.9): consumes the last N iteration summaries, produces
//! a `POST_SOAK_SNAPSHOT` with per-KPI aggregates and a binary verdict.

use serde::{Deserialize, Serialize};

use crate::artifact_store::IterationSummary;
use crate::config::KpiGateConfig;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KpiAggregate {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl KpiAggregate {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Self {
            mean,
            median,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSoakSnapshot {
    pub window: usize,
    pub iterations: Vec<u64>,
    pub maker_taker_ratio: KpiAggregate,
    pub net_bps: KpiAggregate,
    pub p95_latency_ms: KpiAggregate,
    pub risk_ratio: KpiAggregate,
    pub verdict: String,
    pub per_metric: Vec<MetricVerdict>,
    pub override_forced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricVerdict {
    pub metric: &'static str,
    pub observed: f64,
    pub threshold: f64,
    pub passed: bool,
}

/// Builds the snapshot from the last `cfg.window` summaries (by iteration
/// index, ascending). Fewer summaries than the window simply use what's
/// available rather than erroring.
pub fn build_snapshot(summaries: &[IterationSummary], cfg: &KpiGateConfig) -> PostSoakSnapshot {
    let mut sorted: Vec<&IterationSummary> = summaries.iter().collect();
    sorted.sort_by_key(|s| s.iteration);
    let window: Vec<&IterationSummary> = sorted
        .into_iter()
        .rev()
        .take(cfg.window)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let maker_taker: Vec<f64> = window.iter().map(|s| s.summary.maker_taker_ratio).collect();
    let net_bps: Vec<f64> = window.iter().map(|s| s.summary.net_bps).collect();
    let p95_latency: Vec<f64> = window.iter().map(|s| s.summary.p95_latency_ms).collect();
    let risk_ratio: Vec<f64> = window.iter().map(|s| s.summary.risk_ratio).collect();

    let maker_taker_agg = KpiAggregate::from_samples(&maker_taker);
    let net_bps_agg = KpiAggregate::from_samples(&net_bps);
    let p95_latency_agg = KpiAggregate::from_samples(&p95_latency);
    let risk_ratio_agg = KpiAggregate::from_samples(&risk_ratio);

    let per_metric = vec![
        MetricVerdict {
            metric: "maker_taker_ratio.mean",
            observed: maker_taker_agg.mean,
            threshold: cfg.min_maker_taker_ratio_mean,
            passed: maker_taker_agg.mean >= cfg.min_maker_taker_ratio_mean,
        },
        MetricVerdict {
            metric: "net_bps.mean",
            observed: net_bps_agg.mean,
            threshold: cfg.min_net_bps_mean,
            passed: net_bps_agg.mean >= cfg.min_net_bps_mean,
        },
        MetricVerdict {
            metric: "p95_latency_ms.max",
            observed: p95_latency_agg.max,
            threshold: cfg.max_p95_latency_ms_max,
            passed: p95_latency_agg.max <= cfg.max_p95_latency_ms_max,
        },
        MetricVerdict {
            metric: "risk_ratio.median",
            observed: risk_ratio_agg.median,
            threshold: cfg.max_risk_ratio_median,
            passed: risk_ratio_agg.median <= cfg.max_risk_ratio_median,
        },
    ];

    let all_passed = per_metric.iter().all(|m| m.passed);
    let verdict = if cfg.override_force_pass || all_passed {
        "PASS"
    } else {
        "FAIL"
    };

    PostSoakSnapshot {
        window: window.len(),
        iterations: window.iter().map(|s| s.iteration).collect(),
        maker_taker_ratio: maker_taker_agg,
        net_bps: net_bps_agg,
        p95_latency_ms: p95_latency_agg,
        risk_ratio: risk_ratio_agg,
        verdict: verdict.to_string(),
        per_metric,
        override_forced: cfg.override_force_pass && !all_passed,
    }
}
