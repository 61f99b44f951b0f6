//! Delta Verifier CLI (spec §4.8). Reads `TUNING_REPORT.json` and every
//! `ITER_SUMMARY_N.json` under `--path`, classifies each consecutive
//! iteration pair, and exits non-zero when the chosen mode's verdict fails.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use mm_soak_orchestrator::artifact_store::ArtifactStore;
use mm_soak_orchestrator::delta_verifier::{verify, PairVerdict, VerifierMode};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Default,
    Strict,
    Soft,
}

impl From<ModeArg> for VerifierMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Default => VerifierMode::Default,
            ModeArg::Strict => VerifierMode::Strict,
            ModeArg::Soft => VerifierMode::Soft,
        }
    }
}

/// Classifies applied-delta outcomes against proposed deltas across a soak run.
#[derive(Parser, Debug)]
#[command(name = "delta_verifier")]
struct Cli {
    /// Artifact stream directory (contains ITER_SUMMARY_N.json files)
    #[arg(long)]
    path: PathBuf,

    #[arg(long, value_enum, default_value_t = ModeArg::Default)]
    mode: ModeArg,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delta_verifier=info".into()),
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

    if summaries.is_empty() {
        warn!(path = %cli.path.display(), "no iteration summaries found");
    }

    let report = verify(&summaries, cli.mode.into());

    for pair in &report.pairs {
        match pair.verdict {
            PairVerdict::Fail => warn!(iteration = pair.iteration, verdict = ?pair.verdict, "delta verification failed"),
            PairVerdict::SignatureStuck => {
                warn!(iteration = pair.iteration, verdict = ?pair.verdict, "signature-stuck anomaly")
            }
            _ => info!(iteration = pair.iteration, verdict = ?pair.verdict, "pair verdict"),
        }
    }

    info!(
        full_apply_ratio = report.full_apply_ratio,
        signature_stuck_count = report.signature_stuck_count,
        verdict_pass = report.verdict_pass,
        "delta verification complete"
    );

    if report.verdict_pass {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
