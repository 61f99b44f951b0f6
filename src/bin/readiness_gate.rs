//! Readiness Gate CLI (spec §6 "Readiness Gate CLI contract").
//!
//! Reads the accumulated iteration summaries under `--path`, builds a
//! `POST_SOAK_SNAPSHOT` over the last-N window, and exits 0/1 on the
//! resulting verdict. `READINESS_OVERRIDE=1` forces a PASS exit code while
//! the snapshot still reports the actual observed values.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mm_soak_orchestrator::artifact_store::ArtifactStore;
use mm_soak_orchestrator::config::KpiGateConfig;
use mm_soak_orchestrator::kpi_gate::build_snapshot;

/// Reads soak artifacts and decides release-gate PASS/FAIL.
#[derive(Parser, Debug)]
#[command(name = "readiness_gate")]
struct Cli {
    /// Artifact stream directory (contains ITER_SUMMARY_N.json files)
    #[arg(long)]
    path: PathBuf,

    #[arg(long, default_value_t = 0.83)]
    min_maker_taker: f64,

    #[arg(long, default_value_t = 2.9)]
    min_edge: f64,

    #[arg(long, default_value_t = 330.0)]
    max_latency: f64,

    #[arg(long, default_value_t = 0.40)]
    max_risk: f64,

    #[arg(long, default_value_t = 8)]
    window: usize,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "readiness_gate=info".into()),
        )
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let store = ArtifactStore::new(cli.path.as_path());
    let summaries = match store.read_all_iteration_summaries() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, path = %cli.path.display(), "failed to read iteration summaries");
            return ExitCode::from(2);
        }
    };

    let override_force_pass = std::env::var("READINESS_OVERRIDE")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false);

    let cfg = KpiGateConfig {
        window: cli.window,
        min_maker_taker_ratio_mean: cli.min_maker_taker,
        min_net_bps_mean: cli.min_edge,
        max_p95_latency_ms_max: cli.max_latency,
        max_risk_ratio_median: cli.max_risk,
        override_force_pass,
    };

    let snapshot = build_snapshot(&summaries, &cfg);
    match store.write_post_soak_snapshot(&snapshot) {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "failed to write POST_SOAK_SNAPSHOT.json");
            return ExitCode::from(2);
        }
    }

    info!(
        verdict = %snapshot.verdict,
        override_forced = snapshot.override_forced,
        window = snapshot.window,
        "readiness gate verdict"
    );
    for metric in &snapshot.per_metric {
        info!(
            metric = metric.metric,
            observed = metric.observed,
            threshold = metric.threshold,
            passed = metric.passed,
            "metric verdict"
        );
    }

    if snapshot.verdict == "PASS" {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
