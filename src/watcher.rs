//! Iteration Watcher (spec §4.4): summarises one iteration's tick samples
//! and fill stream into canonical KPIs, detects the dominant negative-edge
//! drivers, and proposes a bounded parameter delta.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metrics::MetricsRegistry;
use crate::params::{
    BASE_SPREAD_BPS_DELTA, IMPACT_CAP_RATIO, MAX_DELTA_RATIO, MIN_INTERVAL_MS,
    REPLACE_RATE_PER_MIN, TAIL_AGE_MS,
};

/// Drops NaN/Inf entries before any aggregate touches them (spec §7
/// `NumericDomain`: dropped, not propagated; the caller counts them).
fn finite_only(samples: &[f64]) -> (Vec<f64>, u64) {
    let mut kept = Vec::with_capacity(samples.len());
    let mut dropped = 0u64;
    for &s in samples {
        if s.is_finite() {
            kept.push(s);
        } else {
            dropped += 1;
        }
    }
    (kept, dropped)
}

fn mean(samples: &[f64]) -> (f64, u64) {
    let (finite, dropped) = finite_only(samples);
    if finite.is_empty() {
        (0.0, dropped)
    } else {
        (finite.iter().sum::<f64>() / finite.len() as f64, dropped)
    }
}

/// Nearest-rank 95th percentile over `samples`. Empty input reads as zero
/// rather than panicking — an iteration with no samples for a metric
/// simply contributes no signal for it.
fn p95(samples: &[f64]) -> (f64, u64) {
    let (mut sorted, dropped) = finite_only(samples);
    if sorted.is_empty() {
        return (0.0, dropped);
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((0.95 * sorted.len() as f64).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    (sorted[rank], dropped)
}

/// Raw observations collected by the Tick Orchestrator over one iteration
/// window, handed to the Watcher at iteration end.
#[derive(Debug, Clone, Default)]
pub struct IterationObservations {
    pub gross_bps_samples: Vec<f64>,
    /// Raw (unsigned) fee bps; forced negative at ingest (spec §4.4).
    pub fees_bps_samples: Vec<f64>,
    pub slippage_bps_samples: Vec<f64>,
    pub inventory_bps_samples: Vec<f64>,
    pub adverse_bps_samples: Vec<f64>,
    pub order_age_ms_samples: Vec<f64>,
    pub ws_lag_ms_samples: Vec<f64>,
    pub tick_total_ms_samples: Vec<f64>,
    pub fills_maker_count: u64,
    pub fills_total_count: u64,
    pub fills_maker_volume: f64,
    pub fills_total_volume: f64,
    /// Externally supplied weekly rollup `1 - taker_share`, when available.
    pub external_maker_share: Option<f64>,
    pub cancels: u64,
    pub risk_blocked_count: u64,
    pub risk_checked_count: u64,
    pub min_interval_blocks: u64,
}

/// Source the `maker_taker_ratio` was actually derived from (spec §4.4,
/// recorded in the artifact as `maker_taker_source`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MakerTakerSource {
    FillsVolume,
    FillsCount,
    Rollup,
    Mock,
}

impl MakerTakerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MakerTakerSource::FillsVolume => "fills_volume",
            MakerTakerSource::FillsCount => "fills_count",
            MakerTakerSource::Rollup => "rollup",
            MakerTakerSource::Mock => "mock",
        }
    }
}

const MOCK_MAKER_TAKER_RATIO: f64 = 0.80;

/// Canonical KPI aggregates for one iteration (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationKpis {
    pub net_bps: f64,
    pub gross_bps: f64,
    pub fees_eff_bps: f64,
    pub slippage_bps: f64,
    pub inventory_bps: f64,
    pub maker_taker_ratio: f64,
    pub maker_taker_source: MakerTakerSource,
    pub p95_latency_ms: f64,
    pub order_age_p95_ms: f64,
    pub ws_lag_p95_ms: f64,
    pub adverse_bps_p95: f64,
    pub slippage_bps_p95: f64,
    pub risk_ratio: f64,
    pub cancel_ratio: f64,
}

impl IterationKpis {
    pub fn from_observations(obs: &IterationObservations) -> Self {
        Self::from_observations_with_metrics(obs, None)
    }

    pub fn from_observations_with_metrics(
        obs: &IterationObservations,
        metrics: Option<&MetricsRegistry>,
    ) -> Self {
        let mut dropped_total = 0u64;
        let mut track = |dropped: u64| dropped_total += dropped;

        let (gross_bps, d) = mean(&obs.gross_bps_samples);
        track(d);
        // Fees are forced negative at ingest regardless of sign convention
        // upstream (spec §4.4 sign convention).
        let (fees_mean, d) = mean(&obs.fees_bps_samples);
        track(d);
        let fees_eff_bps = -fees_mean.abs();
        let (slippage_bps, d) = mean(&obs.slippage_bps_samples);
        track(d);
        let (inventory_bps, d) = mean(&obs.inventory_bps_samples);
        track(d);
        // Adverse selection is tracked but never subtracted here — the
        // formula fix spec.md §9 calls out explicitly.
        let net_bps = gross_bps + fees_eff_bps + slippage_bps - inventory_bps.abs();

        let (maker_taker_ratio, maker_taker_source) = if obs.fills_total_volume > 0.0 {
            (
                obs.fills_maker_volume / obs.fills_total_volume,
                MakerTakerSource::FillsVolume,
            )
        } else if obs.fills_total_count > 0 {
            (
                obs.fills_maker_count as f64 / obs.fills_total_count as f64,
                MakerTakerSource::FillsCount,
            )
        } else if let Some(external) = obs.external_maker_share {
            (external, MakerTakerSource::Rollup)
        } else {
            (MOCK_MAKER_TAKER_RATIO, MakerTakerSource::Mock)
        };

        let risk_ratio = if obs.risk_checked_count > 0 {
            obs.risk_blocked_count as f64 / obs.risk_checked_count as f64
        } else {
            0.0
        };

        let cancel_plus_fills = obs.cancels + obs.fills_total_count;
        let cancel_ratio = if cancel_plus_fills > 0 {
            obs.cancels as f64 / cancel_plus_fills as f64
        } else {
            0.0
        };

        let (p95_latency_ms, d) = p95(&obs.tick_total_ms_samples);
        track(d);
        let (order_age_p95_ms, d) = p95(&obs.order_age_ms_samples);
        track(d);
        let (ws_lag_p95_ms, d) = p95(&obs.ws_lag_ms_samples);
        track(d);
        let (adverse_bps_p95, d) = p95(&obs.adverse_bps_samples);
        track(d);
        let (slippage_bps_p95, d) = p95(&obs.slippage_bps_samples);
        track(d);

        if dropped_total > 0 {
            if let Some(m) = metrics {
                for _ in 0..dropped_total {
                    m.record_numeric_domain_drop();
                }
            }
        }

        Self {
            net_bps,
            gross_bps,
            fees_eff_bps,
            slippage_bps,
            inventory_bps,
            maker_taker_ratio,
            maker_taker_source,
            p95_latency_ms,
            order_age_p95_ms,
            ws_lag_p95_ms,
            adverse_bps_p95,
            slippage_bps_p95,
            risk_ratio,
            cancel_ratio,
        }
    }
}

/// Driver detection thresholds. The slippage/adverse/risk thresholds are
/// given verbatim by spec §4.4; the `ws_lag`/`min_interval_blocks`
/// thresholds are not pinned by the spec text (an acknowledged ambiguity,
/// spec.md §9) — see DESIGN.md for the chosen defaults.
#[derive(Debug, Clone, Copy)]
pub struct WatcherThresholds {
    pub slippage_bps_p95: f64,
    pub adverse_bps_p95: f64,
    pub risk_ratio_high: f64,
    pub risk_ratio_mid: f64,
    pub order_age_p95_ms: f64,
    pub ws_lag_p95_ms: f64,
    pub min_interval_blocks: u64,
    pub maker_taker_low: f64,
    pub maker_bias_net_bps_floor: f64,
}

impl Default for WatcherThresholds {
    fn default() -> Self {
        Self {
            slippage_bps_p95: 2.5,
            adverse_bps_p95: 4.0,
            risk_ratio_high: 0.60,
            risk_ratio_mid: 0.40,
            order_age_p95_ms: 330.0,
            ws_lag_p95_ms: 150.0,
            min_interval_blocks: 5,
            maker_taker_low: 0.85,
            maker_bias_net_bps_floor: 2.7,
        }
    }
}

/// A negative-edge driver tag, ordered by the fixed tie-break priority
/// (spec §4.4: risk, slippage, adverse, age, lag — `min_interval_blocks`
/// is not named in the priority list and is treated as lowest priority,
/// see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Driver {
    RiskBlocks,
    SlippageBps,
    AdverseBps,
    OrderAge,
    WsLag,
    MinIntervalBlocks,
}

impl Driver {
    pub fn tag(self) -> &'static str {
        match self {
            Driver::RiskBlocks => "risk_blocks",
            Driver::SlippageBps => "slippage_bps",
            Driver::AdverseBps => "adverse_bps",
            Driver::OrderAge => "order_age",
            Driver::WsLag => "ws_lag",
            Driver::MinIntervalBlocks => "min_interval_blocks",
        }
    }
}

/// Detects every driver currently firing, ordered by the fixed priority.
pub fn detect_drivers(
    kpis: &IterationKpis,
    obs: &IterationObservations,
    t: &WatcherThresholds,
) -> Vec<Driver> {
    let mut drivers = Vec::new();
    if kpis.risk_ratio >= t.risk_ratio_mid {
        drivers.push(Driver::RiskBlocks);
    }
    if kpis.slippage_bps_p95 > t.slippage_bps_p95 {
        drivers.push(Driver::SlippageBps);
    }
    if kpis.adverse_bps_p95 > t.adverse_bps_p95 {
        drivers.push(Driver::AdverseBps);
    }
    if kpis.order_age_p95_ms > t.order_age_p95_ms {
        drivers.push(Driver::OrderAge);
    }
    if kpis.ws_lag_p95_ms > t.ws_lag_p95_ms {
        drivers.push(Driver::WsLag);
    }
    if obs.min_interval_blocks >= t.min_interval_blocks {
        drivers.push(Driver::MinIntervalBlocks);
    }
    drivers.sort();
    drivers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Per-iteration delta candidate (spec §3). Never persisted raw — only its
/// merged/applied form (via the Delta Pipeline) survives into the summary.
#[derive(Debug, Clone, Default)]
pub struct Proposal {
    pub deltas: BTreeMap<String, f64>,
    pub rationale: Vec<String>,
    pub severity: Option<Severity>,
}

impl Proposal {
    fn add(&mut self, key: &str, delta: f64) {
        *self.deltas.entry(key.to_string()).or_insert(0.0) += delta;
    }

    fn tag(&mut self, tag: &str) {
        if !self.rationale.contains(&tag.to_string()) {
            self.rationale.push(tag.to_string());
        }
    }
}

/// Builds the driver-aware proposal (spec §4.4 table). `current_overrides`
/// supplies the values needed for the table's absolute-floor/multiplicative
/// rules (`tail_age_ms := max(tail, 680)`, `replace_rate_per_min *= 0.85`);
/// the resulting map is still expressed as deltas, per the `Proposal`
/// contract. No clamping happens here — that is the Delta Pipeline's job
/// (spec §4.4 final sentence).
pub fn propose_deltas(
    kpis: &IterationKpis,
    obs: &IterationObservations,
    current_overrides: &BTreeMap<String, f64>,
    t: &WatcherThresholds,
) -> Proposal {
    let mut p = Proposal::default();
    let current = |key: &str, default: f64| *current_overrides.get(key).unwrap_or(&default);

    if kpis.risk_ratio >= t.risk_ratio_high {
        p.add(MIN_INTERVAL_MS, 5.0);
        p.add(BASE_SPREAD_BPS_DELTA, 0.02);
        p.add(IMPACT_CAP_RATIO, -0.01);
        let tail = current(TAIL_AGE_MS, 500.0);
        p.add(TAIL_AGE_MS, tail.max(680.0) - tail);
        p.tag("risk_blocks");
    } else if kpis.risk_ratio >= t.risk_ratio_mid {
        p.add(MIN_INTERVAL_MS, 5.0);
        p.add(IMPACT_CAP_RATIO, -0.01);
        p.tag("risk_blocks");
    }

    if kpis.slippage_bps_p95 > t.slippage_bps_p95 {
        p.add(BASE_SPREAD_BPS_DELTA, 0.02);
        p.add(TAIL_AGE_MS, 30.0);
        p.tag("slippage_bps");
    }

    if kpis.adverse_bps_p95 > t.adverse_bps_p95 {
        p.add(IMPACT_CAP_RATIO, -0.01);
        p.add(MAX_DELTA_RATIO, -0.01);
        p.tag("adverse_bps");
    }

    let age_relief = kpis.order_age_p95_ms > t.order_age_p95_ms
        && kpis.adverse_bps_p95 <= t.adverse_bps_p95
        && kpis.slippage_bps_p95 <= 3.0;
    if age_relief {
        p.add(MIN_INTERVAL_MS, -10.0);
        p.add(REPLACE_RATE_PER_MIN, 30.0);
        p.tag("age_relief");
    }

    let maker_bias = kpis.maker_taker_ratio < t.maker_taker_low
        && kpis.risk_ratio <= t.risk_ratio_mid
        && kpis.net_bps >= t.maker_bias_net_bps_floor;
    if maker_bias {
        p.add(BASE_SPREAD_BPS_DELTA, 0.015);
        let replace_rate = current(REPLACE_RATE_PER_MIN, 300.0);
        p.add(REPLACE_RATE_PER_MIN, replace_rate * 0.85 - replace_rate);
        p.add(MIN_INTERVAL_MS, 25.0);
        p.tag("maker_bias");
    }

    let driver_count = detect_drivers(kpis, obs, t)
        .into_iter()
        .filter(|d| !matches!(d, Driver::WsLag | Driver::MinIntervalBlocks))
        .count();
    p.severity = Some(if kpis.risk_ratio >= t.risk_ratio_high || driver_count >= 3 {
        Severity::High
    } else if driver_count > 0 {
        Severity::Medium
    } else {
        Severity::Low
    });

    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_obs() -> IterationObservations {
        IterationObservations {
            fills_total_count: 10,
            fills_maker_count: 8,
            risk_checked_count: 100,
            ..Default::default()
        }
    }

    #[test]
    fn net_bps_does_not_subtract_adverse() {
        let obs = IterationObservations {
            gross_bps_samples: vec![5.0],
            fees_bps_samples: vec![1.0],
            slippage_bps_samples: vec![0.5],
            inventory_bps_samples: vec![0.2],
            adverse_bps_samples: vec![10.0],
            ..base_obs()
        };
        let kpis = IterationKpis::from_observations(&obs);
        // net = 5 + (-1) + 0.5 - 0.2 = 4.3, independent of the 10.0 adverse sample.
        assert!((kpis.net_bps - 4.3).abs() < 1e-9);
    }

    #[test]
    fn maker_taker_source_priority_prefers_volume_over_count() {
        let obs = IterationObservations {
            fills_maker_volume: 30.0,
            fills_total_volume: 100.0,
            fills_maker_count: 1,
            fills_total_count: 10,
            ..Default::default()
        };
        let kpis = IterationKpis::from_observations(&obs);
        assert_eq!(kpis.maker_taker_source, MakerTakerSource::FillsVolume);
        assert!((kpis.maker_taker_ratio - 0.30).abs() < 1e-9);
    }

    #[test]
    fn maker_taker_falls_back_to_mock_constant() {
        let obs = IterationObservations::default();
        let kpis = IterationKpis::from_observations(&obs);
        assert_eq!(kpis.maker_taker_source, MakerTakerSource::Mock);
        assert!((kpis.maker_taker_ratio - 0.80).abs() < 1e-9);
    }

    #[test]
    fn age_relief_scenario_matches_spec_example() {
        // Scenario 1: order_age_p95=350, adverse=3.3, slippage=2.35,
        // current min_interval_ms=60, replace_rate_per_min=300.
        let obs = IterationObservations {
            order_age_ms_samples: vec![350.0],
            adverse_bps_samples: vec![3.3],
            slippage_bps_samples: vec![2.35],
            risk_checked_count: 100,
            ..Default::default()
        };
        let kpis = IterationKpis::from_observations(&obs);
        let mut current = BTreeMap::new();
        current.insert(MIN_INTERVAL_MS.to_string(), 60.0);
        current.insert(REPLACE_RATE_PER_MIN.to_string(), 300.0);

        let t = WatcherThresholds::default();
        let proposal = propose_deltas(&kpis, &obs, &current, &t);

        assert!((proposal.deltas[MIN_INTERVAL_MS] - -10.0).abs() < 1e-9);
        assert!((proposal.deltas[REPLACE_RATE_PER_MIN] - 30.0).abs() < 1e-9);
        assert!(proposal.rationale.contains(&"age_relief".to_string()));
    }

    #[test]
    fn multi_fail_scenario_produces_nonempty_proposal_with_several_drivers() {
        // Scenario 2: risk=0.62, adverse=5.1, slippage=3.2, order_age=410.
        let obs = IterationObservations {
            risk_blocked_count: 62,
            risk_checked_count: 100,
            adverse_bps_samples: vec![5.1],
            slippage_bps_samples: vec![3.2],
            order_age_ms_samples: vec![410.0],
            ..Default::default()
        };
        let kpis = IterationKpis::from_observations(&obs);
        let t = WatcherThresholds::default();
        let drivers = detect_drivers(&kpis, &obs, &t);
        assert!(drivers.len() >= 3);
        assert_eq!(drivers[0], Driver::RiskBlocks);

        let proposal = propose_deltas(&kpis, &obs, &BTreeMap::new(), &t);
        assert!(!proposal.deltas.is_empty());
    }

    #[test]
    fn driver_priority_orders_risk_before_slippage_before_adverse() {
        let obs = IterationObservations {
            risk_blocked_count: 50,
            risk_checked_count: 100,
            slippage_bps_samples: vec![3.0],
            adverse_bps_samples: vec![4.5],
            ..Default::default()
        };
        let kpis = IterationKpis::from_observations(&obs);
        let t = WatcherThresholds::default();
        let drivers = detect_drivers(&kpis, &obs, &t);
        assert_eq!(
            drivers,
            vec![Driver::RiskBlocks, Driver::SlippageBps, Driver::AdverseBps]
        );
    }

    #[test]
    fn proposal_is_empty_when_nothing_fires() {
        let obs = IterationObservations {
            risk_checked_count: 100,
            ..Default::default()
        };
        let kpis = IterationKpis::from_observations(&obs);
        let t = WatcherThresholds::default();
        let proposal = propose_deltas(&kpis, &obs, &BTreeMap::new(), &t);
        assert!(proposal.deltas.is_empty());
        assert_eq!(proposal.severity, Some(Severity::Low));
    }
}
