//! Market-making soak/tuning orchestrator process entrypoint.
//!
//! Loads configuration from the environment, wires an exchange connector
//! backend (`fake` by default; `replay` for recorded sessions), runs the
//! `SoakEngine` for the configured iteration count, and handles a single
//! Ctrl-C as a graceful shutdown request.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mm_soak_orchestrator::config::Config;
use mm_soak_orchestrator::connector::{ExchangeConnector, FakeDeterministicConnector, ReplayConnector};
use mm_soak_orchestrator::domain::OrderBookSnapshot;
use mm_soak_orchestrator::engine::SoakEngine;
use mm_soak_orchestrator::strategy::{Strategy, SymmetricQuoteStrategy};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::from_env().context("loading configuration")?;
    info!(
        iterations = cfg.iterations,
        symbols = ?cfg.symbols,
        stream = %cfg.stream_name,
        "soak orchestrator starting"
    );

    let connector = build_connector(&cfg);
    let strategy: Arc<dyn Strategy> = Arc::new(SymmetricQuoteStrategy::default());

    let engine = SoakEngine::new(cfg, connector, strategy);
    let running = engine.running_flag();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, finishing current iteration");
            running.store(false, Ordering::SeqCst);
        }
    });

    engine.run().await.map_err(|e| anyhow::anyhow!(e.to_string()))?;

    info!("soak run complete");
    Ok(())
}

/// Selects the connector backend from `SOAK_CONNECTOR` (`fake` default,
/// `replay` reads `SOAK_REPLAY_DIR`). The live backend is intentionally
/// not selectable here — its wire protocol is out of scope.
fn build_connector(cfg: &Config) -> Arc<dyn ExchangeConnector> {
    match std::env::var("SOAK_CONNECTOR").unwrap_or_else(|_| "fake".to_string()).as_str() {
        "replay" => {
            let dir = std::env::var("SOAK_REPLAY_DIR").unwrap_or_else(|_| "replay".to_string());
            Arc::new(ReplayConnector::new(load_replay_recordings(&dir, &cfg.symbols)))
        }
        _ => Arc::new(FakeDeterministicConnector::new(cfg.seed, &cfg.symbols)),
    }
}

/// Reads `<dir>/<symbol>.json` (an array of `OrderBookSnapshot`) for each
/// configured symbol; a symbol with no recording file simply gets no
/// entry, which `ReplayConnector` surfaces as a per-call error rather than
/// a startup failure.
fn load_replay_recordings(dir: &str, symbols: &[String]) -> HashMap<String, Vec<OrderBookSnapshot>> {
    let mut recordings = HashMap::new();
    for symbol in symbols {
        let path = std::path::Path::new(dir).join(format!("{symbol}.json"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Vec<OrderBookSnapshot>>(&contents) {
                Ok(sequence) => {
                    recordings.insert(symbol.clone(), sequence);
                }
                Err(e) => warn!(symbol, error = %e, "failed to parse replay recording"),
            },
            Err(_) => warn!(symbol, path = %path.display(), "no replay recording found for symbol"),
        }
    }
    recordings
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mm_soak_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
