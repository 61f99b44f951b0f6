//! Soak Engine (spec §2 control-flow): the top-level iteration loop
//! tying the Tick Orchestrator, Iteration Watcher, Guards Coordinator,
//! Delta Application Pipeline, and Artifact Store together.
//!
//! One iteration: run ticks for `iteration_duration_secs`, summarise into
//! KPIs, detect drivers, propose a delta, narrow it through the guards,
//! apply it, write the iteration summary, sleep, repeat.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::artifact_store::{ArtifactStore, IterationSummary};
use crate::clock::WallClock;
use crate::config::Config;
use crate::connector::ExchangeConnector;
use crate::domain::{OrderStore, PositionTracker};
use crate::errors::{EngineError, FailureRecord};
use crate::guards;
use crate::kpi_gate;
use crate::metrics::MetricsRegistry;
use crate::orchestrator::TickOrchestrator;
use crate::risk_monitor::RuntimeRiskMonitor;
use crate::strategy::Strategy;
use crate::tuning_state::TuningState;
use crate::watcher::{self, WatcherThresholds};

/// Everything one soak run needs that isn't purely configuration: the
/// connector backend and the strategy under test. Kept as trait objects
/// so `main` can wire in whichever backend the process was started with.
pub struct SoakEngine {
    cfg: Config,
    clock: WallClock,
    store: ArtifactStore,
    metrics: Arc<MetricsRegistry>,
    orchestrator: Arc<TickOrchestrator>,
    /// Flipped to `false` on shutdown signal; checked between iterations
    /// and between ticks so a running iteration still flushes cleanly
    /// (spec §5 "current tick completes, current iteration flushed").
    running: Arc<AtomicBool>,
}

impl SoakEngine {
    pub fn new(
        cfg: Config,
        connector: Arc<dyn ExchangeConnector>,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        let clock = WallClock::from_env();
        let metrics = Arc::new(MetricsRegistry::new());
        let risk_monitor = Arc::new(RuntimeRiskMonitor::new(cfg.risk.clone()));
        let orchestrator = Arc::new(TickOrchestrator::with_chaos(
            connector,
            strategy,
            Arc::new(OrderStore::new()),
            Arc::new(PositionTracker::new()),
            risk_monitor,
            metrics.clone(),
            clock.clone(),
            cfg.async_batch.clone(),
            cfg.risk.clone(),
            cfg.chaos.clone(),
            cfg.md_cache.ttl_ms,
        ));
        let store = ArtifactStore::new(cfg.artifact_stream_dir());

        Self {
            cfg,
            clock,
            store,
            metrics,
            orchestrator,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A clone of the shutdown flag; the caller wires this to a signal
    /// handler and calls `store(false, Ordering::SeqCst)` on it.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// Runs `cfg.iterations` iterations (or until the running flag drops),
    /// then writes `POST_SOAK_SNAPSHOT.json` and `FAILURES.md`.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut tuning_state = TuningState::load(&self.store.tuning_state_path())?;
        let thresholds = WatcherThresholds::default();
        let mut failures = Vec::new();

        for iteration in 1..=self.cfg.iterations {
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!(iteration, "shutdown requested, stopping before next iteration");
                break;
            }

            let overrides = tuning_state.overrides.clone();
            let observations = self
                .orchestrator
                .run_iteration(
                    &self.cfg.symbols,
                    &overrides,
                    Duration::from_secs(self.cfg.iteration_duration_secs),
                )
                .await;

            let kpis =
                watcher::IterationKpis::from_observations_with_metrics(&observations, Some(&self.metrics));
            let drivers = watcher::detect_drivers(&kpis, &observations, &thresholds);
            let mut proposal = watcher::propose_deltas(&kpis, &observations, &overrides, &thresholds);
            let raw_proposed_deltas: BTreeMap<String, f64> = proposal.deltas.clone();

            let kpi_verdict_pre_guards = if kpis.net_bps < 0.0 {
                guards::Verdict::Fail
            } else if drivers.is_empty() {
                guards::Verdict::Pass
            } else {
                guards::Verdict::Warn
            };

            let (guard_decision, kpi_verdict) = guards::evaluate(
                &mut proposal,
                &drivers,
                kpi_verdict_pre_guards,
                iteration,
                &tuning_state,
                &self.cfg.guards,
            );
            for tag in &guard_decision.outcome_tags {
                self.metrics.record_guard_trip(tag);
            }
            for param in &guard_decision.newly_oscillation_frozen {
                tuning_state
                    .oscillation_freeze_until
                    .insert(param.clone(), iteration + self.cfg.guards.cooldown_iterations);
            }
            if kpi_verdict == guards::Verdict::Pass && drivers.is_empty() {
                tuning_state.consecutive_clean_passes += 1;
            } else {
                tuning_state.consecutive_clean_passes = 0;
            }

            let (next_state, outcome) = crate::delta_pipeline::apply(
                &tuning_state,
                &proposal,
                &guard_decision,
                iteration,
                &self.store.runtime_overrides_path(),
                &self.metrics,
            )?;
            tuning_state = next_state;
            tuning_state.persist(&self.store.tuning_state_path())?;

            let summary = IterationSummary {
                iteration,
                runtime_utc: self.clock.now_iso(),
                net_bps: kpis.net_bps,
                kpi_verdict,
                neg_edge_drivers: drivers.iter().map(|d| d.tag().to_string()).collect(),
                proposed_deltas: raw_proposed_deltas,
                freeze_ready: guard_decision.freeze_ready,
                tuning: outcome.clone(),
                maker_taker_source: kpis.maker_taker_source,
                summary: kpis,
            };
            self.store.write_iteration_summary(&summary)?;
            self.store.append_tuning_report(iteration, &outcome)?;

            if summary.kpi_verdict == guards::Verdict::Fail {
                failures.push(FailureRecord::new(
                    iteration,
                    summary.neg_edge_drivers.join(","),
                ));
            }
            if outcome.skip_reason.contains(&guards::TAG_WRITE_FAILED.to_string()) {
                failures.push(FailureRecord::new(iteration, guards::TAG_WRITE_FAILED));
            }

            if iteration < self.cfg.iterations && self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(self.cfg.inter_iteration_sleep_secs)).await;
            }
        }

        self.store.write_failures_md(&failures)?;

        let all_summaries = self.store.read_all_iteration_summaries()?;
        let snapshot = kpi_gate::build_snapshot(&all_summaries, &self.cfg.kpi_gate);
        self.store.write_post_soak_snapshot(&snapshot)?;

        Ok(())
    }
}
