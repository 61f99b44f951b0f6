//! Process configuration, loaded from the environment (spec §6
//! "Configuration surface"). YAML config loading and a CLI parsing
//! framework are explicitly out of scope for this core; flags read here are
//! the ones the core itself consumes.

use std::env;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

/// `async_batch.*` — Command Bus coalescing and worker-pool sizing.
#[derive(Debug, Clone)]
pub struct AsyncBatchConfig {
    pub enabled: bool,
    pub max_parallel_symbols: usize,
    pub tick_deadline_ms: u64,
    pub max_batch_size: usize,
}

impl AsyncBatchConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_flag("ASYNC_BATCH_ENABLED", true),
            max_parallel_symbols: env_or("ASYNC_BATCH_MAX_PARALLEL_SYMBOLS", 10),
            tick_deadline_ms: env_or("ASYNC_BATCH_TICK_DEADLINE_MS", 200),
            max_batch_size: env_or("ASYNC_BATCH_MAX_BATCH_SIZE", 20).min(20),
        }
    }
}

/// `chaos.*` — fault injection, used by tests exercising deadline-miss and
/// write-failure paths.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    pub enabled: bool,
    pub dry_run: bool,
    /// Per-scenario intensity, e.g. `"symbol_delay" -> 300` (ms).
    pub scenarios: std::collections::HashMap<String, u64>,
}

impl ChaosConfig {
    fn from_env() -> Self {
        let enabled = env_flag("CHAOS_ENABLED", false);
        let dry_run = env_flag("CHAOS_DRY_RUN", false);
        let mut scenarios = std::collections::HashMap::new();
        if let Ok(raw) = env::var("CHAOS_SCENARIOS") {
            // "name=intensity,name2=intensity2"
            for entry in raw.split(',') {
                if let Some((name, intensity)) = entry.split_once('=') {
                    if let Ok(v) = intensity.trim().parse::<u64>() {
                        scenarios.insert(name.trim().to_string(), v);
                    }
                }
            }
        }
        Self {
            enabled,
            dry_run,
            scenarios,
        }
    }
}

/// `md_cache.*` — market-data caching layer in front of the connector.
#[derive(Debug, Clone)]
pub struct MdCacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
}

impl MdCacheConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_flag("MD_CACHE_ENABLED", true),
            ttl_ms: env_or("MD_CACHE_TTL_MS", 50),
        }
    }
}

/// `taker_cap.*` — reporting-only ceiling on taker share.
#[derive(Debug, Clone)]
pub struct TakerCapConfig {
    pub max_taker_share_pct: f64,
}

impl TakerCapConfig {
    fn from_env() -> Self {
        Self {
            max_taker_share_pct: env_or("TAKER_CAP_MAX_TAKER_SHARE_PCT", 20.0),
        }
    }
}

/// `trace.*` — tracing toggle and sampling.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub enabled: bool,
    pub sample_rate: f64,
}

impl TraceConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_flag("TRACE_ENABLED", true),
            sample_rate: env_or("TRACE_SAMPLE_RATE", 1.0),
        }
    }
}

/// Guard timing/threshold knobs (spec §4.5).
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub warmup_iterations: u64,
    pub rampdown_iterations: u64,
    pub cooldown_iterations: u64,
    pub velocity_window: u64,
    pub freeze_consecutive_passes: u64,
    pub multi_fail_threshold: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 4,
            rampdown_iterations: 2,
            cooldown_iterations: 2,
            velocity_window: 5,
            freeze_consecutive_passes: 7,
            multi_fail_threshold: 3,
        }
    }
}

impl GuardConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            warmup_iterations: env_or("GUARD_WARMUP_ITERATIONS", d.warmup_iterations),
            rampdown_iterations: env_or("GUARD_RAMPDOWN_ITERATIONS", d.rampdown_iterations),
            cooldown_iterations: env_or("GUARD_COOLDOWN_ITERATIONS", d.cooldown_iterations),
            velocity_window: env_or("GUARD_VELOCITY_WINDOW", d.velocity_window),
            freeze_consecutive_passes: env_or(
                "GUARD_FREEZE_CONSECUTIVE_PASSES",
                d.freeze_consecutive_passes,
            ),
            multi_fail_threshold: env_or("GUARD_MULTI_FAIL_THRESHOLD", d.multi_fail_threshold),
        }
    }
}

/// KPI Gate thresholds (spec §4.9).
#[derive(Debug, Clone)]
pub struct KpiGateConfig {
    pub window: usize,
    pub min_maker_taker_ratio_mean: f64,
    pub min_net_bps_mean: f64,
    pub max_p95_latency_ms_max: f64,
    pub max_risk_ratio_median: f64,
    pub override_force_pass: bool,
}

impl Default for KpiGateConfig {
    fn default() -> Self {
        Self {
            window: 8,
            min_maker_taker_ratio_mean: 0.83,
            min_net_bps_mean: 2.9,
            max_p95_latency_ms_max: 330.0,
            max_risk_ratio_median: 0.40,
            override_force_pass: false,
        }
    }
}

impl KpiGateConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            window: env_or("KPI_GATE_WINDOW", d.window),
            min_maker_taker_ratio_mean: env_or(
                "KPI_GATE_MIN_MAKER_TAKER_RATIO_MEAN",
                d.min_maker_taker_ratio_mean,
            ),
            min_net_bps_mean: env_or("KPI_GATE_MIN_NET_BPS_MEAN", d.min_net_bps_mean),
            max_p95_latency_ms_max: env_or(
                "KPI_GATE_MAX_P95_LATENCY_MS_MAX",
                d.max_p95_latency_ms_max,
            ),
            max_risk_ratio_median: env_or(
                "KPI_GATE_MAX_RISK_RATIO_MEDIAN",
                d.max_risk_ratio_median,
            ),
            override_force_pass: env_flag("READINESS_OVERRIDE", false),
        }
    }
}

/// Runtime Risk Monitor limits (spec §4.7).
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_inventory_per_symbol: f64,
    pub max_total_notional: f64,
    pub edge_freeze_threshold_bps: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_inventory_per_symbol: 5_000.0,
            max_total_notional: 250_000.0,
            edge_freeze_threshold_bps: 0.5,
        }
    }
}

impl RiskConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_inventory_per_symbol: env_or(
                "RISK_MAX_INVENTORY_PER_SYMBOL",
                d.max_inventory_per_symbol,
            ),
            max_total_notional: env_or("RISK_MAX_TOTAL_NOTIONAL", d.max_total_notional),
            edge_freeze_threshold_bps: env_or(
                "RISK_EDGE_FREEZE_THRESHOLD_BPS",
                d.edge_freeze_threshold_bps,
            ),
        }
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub artifact_dir: String,
    pub stream_name: String,
    pub iterations: u64,
    pub iteration_duration_secs: u64,
    pub inter_iteration_sleep_secs: u64,
    pub symbols: Vec<String>,
    pub seed: u64,
    pub async_batch: AsyncBatchConfig,
    pub chaos: ChaosConfig,
    pub md_cache: MdCacheConfig,
    pub taker_cap: TakerCapConfig,
    pub trace: TraceConfig,
    pub guards: GuardConfig,
    pub kpi_gate: KpiGateConfig,
    pub risk: RiskConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let artifact_dir =
            env::var("ARTIFACT_DIR").unwrap_or_else(|_| "artifacts/soak".to_string());
        let stream_name = env::var("STREAM_NAME").unwrap_or_else(|_| "latest".to_string());

        let iterations: u64 = env_or("SOAK_ITERATIONS", 12);
        let iteration_duration_secs: u64 = env_or("SOAK_ITERATION_DURATION_SECS", 60);
        let inter_iteration_sleep_secs: u64 = env_or("SOAK_INTER_ITERATION_SLEEP_SECS", 5);

        let symbols = env::var("SOAK_SYMBOLS")
            .unwrap_or_else(|_| "BTC-USD,ETH-USD,SOL-USD".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let seed: u64 = env_or("SOAK_SEED", 42);

        if iterations == 0 {
            anyhow::bail!("SOAK_ITERATIONS must be >= 1");
        }

        Ok(Self {
            artifact_dir,
            stream_name,
            iterations,
            iteration_duration_secs,
            inter_iteration_sleep_secs,
            symbols,
            seed,
            async_batch: AsyncBatchConfig::from_env(),
            chaos: ChaosConfig::from_env(),
            md_cache: MdCacheConfig::from_env(),
            taker_cap: TakerCapConfig::from_env(),
            trace: TraceConfig::from_env(),
            guards: GuardConfig::from_env(),
            kpi_gate: KpiGateConfig::from_env(),
            risk: RiskConfig::from_env(),
        })
    }

    pub fn artifact_stream_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.artifact_dir).join(&self.stream_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env() {
        // Exercise the per-field defaults directly; mutating process env in
        // a parallel test run is not reliable.
        let guards = GuardConfig::default();
        assert_eq!(guards.cooldown_iterations, 2);
        assert_eq!(guards.velocity_window, 5);

        let gate = KpiGateConfig::default();
        assert_eq!(gate.window, 8);
        assert!((gate.min_maker_taker_ratio_mean - 0.83).abs() < 1e-9);

        let risk = RiskConfig::default();
        assert!(risk.max_inventory_per_symbol > 0.0);
    }

    #[test]
    fn chaos_scenarios_parse_key_value_pairs() {
        std::env::set_var("CHAOS_SCENARIOS", "symbol_delay=300,reject_spike=10");
        let chaos = ChaosConfig::from_env();
        std::env::remove_var("CHAOS_SCENARIOS");
        assert_eq!(chaos.scenarios.get("symbol_delay"), Some(&300));
        assert_eq!(chaos.scenarios.get("reject_spike"), Some(&10));
    }
}
