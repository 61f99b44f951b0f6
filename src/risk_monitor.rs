//! Runtime Risk Monitor (spec §4.7): pre-trade limits, edge-degradation
//! freeze, and position tracking. Shaped after the pack's
//! `PreTradeRiskController` (`backtest_v2/pre_trade_risk.rs`) — named
//! checks carrying observed value + limit + message, not a bare boolean —
//! since that is the richer shape already used for pre-trade checks
//! elsewhere in this codebase.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RiskConfig;
use crate::domain::{ClientId, FillEvent, Side};

/// Result of a single named pre-trade check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub check_name: &'static str,
    pub passed: bool,
    pub observed_value: f64,
    pub limit: f64,
}

impl RiskCheckResult {
    fn pass(check_name: &'static str, observed: f64, limit: f64) -> Self {
        Self {
            check_name,
            passed: true,
            observed_value: observed,
            limit,
        }
    }

    fn fail(check_name: &'static str, observed: f64, limit: f64) -> Self {
        Self {
            check_name,
            passed: false,
            observed_value: observed,
            limit,
        }
    }
}

/// Outcome of `check_before_order`: either the order may proceed, or it is
/// blocked with a structured reason (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RiskDecision {
    Allow,
    Block { reason: String, checks: Vec<RiskCheckResult> },
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }
}

#[derive(Debug, Default)]
struct Inventory {
    base_amount: f64,
}

#[derive(Debug, Default)]
struct RiskState {
    inventory: HashMap<String, Inventory>,
    total_notional: f64,
    last_edge_bps: HashMap<String, f64>,
    frozen: bool,
    last_freeze_reason: Option<String>,
    last_freeze_symbol: Option<String>,
}

/// Process-wide risk monitor: pre-trade checks, fill/edge subscription,
/// freeze-on-edge-degradation. Exposes lock-free counters alongside a
/// short-critical-section `RwLock` for the mutable inventory/freeze state
/// (spec §5 "no component may hold a mutex across a suspension point" —
/// every method here returns before any `.await`).
pub struct RuntimeRiskMonitor {
    cfg: RiskConfig,
    state: RwLock<RiskState>,
    blocks_total: AtomicU64,
    freezes_total: AtomicU64,
}

impl RuntimeRiskMonitor {
    pub fn new(cfg: RiskConfig) -> Self {
        Self {
            cfg,
            state: RwLock::new(RiskState::default()),
            blocks_total: AtomicU64::new(0),
            freezes_total: AtomicU64::new(0),
        }
    }

    /// Pre-trade check for a proposed order. Returns `Block` if frozen or
    /// if the order would breach a per-symbol inventory or total-notional
    /// limit.
    pub fn check_before_order(&self, symbol: &str, side: Side, notional: f64) -> RiskDecision {
        let state = self.state.read();
        if state.frozen {
            self.blocks_total.fetch_add(1, Ordering::Relaxed);
            return RiskDecision::Block {
                reason: "frozen".to_string(),
                checks: vec![RiskCheckResult::fail("frozen", 1.0, 0.0)],
            };
        }

        let current_inventory = state
            .inventory
            .get(symbol)
            .map(|i| i.base_amount)
            .unwrap_or(0.0);
        let proposed_inventory = current_inventory + side.sign() * notional;
        let inventory_check = if proposed_inventory.abs() <= self.cfg.max_inventory_per_symbol {
            RiskCheckResult::pass(
                "max_inventory_per_symbol",
                proposed_inventory.abs(),
                self.cfg.max_inventory_per_symbol,
            )
        } else {
            RiskCheckResult::fail(
                "max_inventory_per_symbol",
                proposed_inventory.abs(),
                self.cfg.max_inventory_per_symbol,
            )
        };

        let proposed_total = state.total_notional + notional.abs();
        let notional_check = if proposed_total <= self.cfg.max_total_notional {
            RiskCheckResult::pass("max_total_notional", proposed_total, self.cfg.max_total_notional)
        } else {
            RiskCheckResult::fail("max_total_notional", proposed_total, self.cfg.max_total_notional)
        };

        let checks = vec![inventory_check, notional_check];
        if checks.iter().all(|c| c.passed) {
            RiskDecision::Allow
        } else {
            self.blocks_total.fetch_add(1, Ordering::Relaxed);
            let reason = checks
                .iter()
                .find(|c| !c.passed)
                .map(|c| c.check_name.to_string())
                .unwrap_or_default();
            RiskDecision::Block { reason, checks }
        }
    }

    /// Applies a fill to the position tracker this monitor maintains for
    /// notional accounting. `PositionTracker` (domain.rs) remains the sole
    /// owner of base-amount inventory for reporting; this mirror exists so
    /// pre-trade checks don't need to cross back into the orchestrator.
    pub fn on_fill(&self, fill: &FillEvent) {
        let mut state = self.state.write();
        let entry = state.inventory.entry(fill.symbol.clone()).or_default();
        entry.base_amount += fill.side.sign() * fill.size;
        state.total_notional += fill.price * fill.size;
    }

    /// Updates the tracked edge for `symbol`; crosses the freeze threshold
    /// downward arms the freeze, upward does not auto-release it (release
    /// is explicit via [`Self::release_freeze`], matching spec.md §9's
    /// "no hysteresis unless opt-in").
    pub fn on_edge_update(&self, symbol: &str, edge_bps: f64) {
        let mut state = self.state.write();
        state.last_edge_bps.insert(symbol.to_string(), edge_bps);
        if edge_bps < self.cfg.edge_freeze_threshold_bps && !state.frozen {
            state.frozen = true;
            state.last_freeze_reason = Some("edge_degradation".to_string());
            state.last_freeze_symbol = Some(symbol.to_string());
            self.freezes_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn request_freeze(&self, reason: impl Into<String>) {
        let mut state = self.state.write();
        if !state.frozen {
            state.frozen = true;
            state.last_freeze_reason = Some(reason.into());
            self.freezes_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn release_freeze(&self) {
        self.state.write().frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen
    }

    /// Returns the client ids that should be cancelled because the monitor
    /// just entered a freeze. The caller (orchestrator) owns the actual
    /// order store; this only signals intent by symbol.
    pub fn cancel_all_if_frozen(&self, open_client_ids: &[ClientId]) -> Vec<ClientId> {
        if self.is_frozen() {
            open_client_ids.to_vec()
        } else {
            Vec::new()
        }
    }

    pub fn blocks_total(&self) -> u64 {
        self.blocks_total.load(Ordering::Relaxed)
    }

    pub fn freezes_total(&self) -> u64 {
        self.freezes_total.load(Ordering::Relaxed)
    }

    pub fn last_freeze_reason(&self) -> Option<String> {
        self.state.read().last_freeze_reason.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        RiskConfig {
            max_inventory_per_symbol: 100.0,
            max_total_notional: 10_000.0,
            edge_freeze_threshold_bps: 0.5,
        }
    }

    #[test]
    fn allows_order_within_limits() {
        let monitor = RuntimeRiskMonitor::new(cfg());
        let decision = monitor.check_before_order("BTC-USD", Side::Buy, 50.0);
        assert!(decision.is_allowed());
    }

    #[test]
    fn blocks_order_exceeding_inventory_limit() {
        let monitor = RuntimeRiskMonitor::new(cfg());
        let decision = monitor.check_before_order("BTC-USD", Side::Buy, 150.0);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn edge_update_below_threshold_arms_freeze_and_blocks_everything() {
        let monitor = RuntimeRiskMonitor::new(cfg());
        monitor.on_edge_update("BTC-USD", 0.1);
        assert!(monitor.is_frozen());
        let decision = monitor.check_before_order("ETH-USD", Side::Sell, 1.0);
        assert!(!decision.is_allowed());
        assert_eq!(monitor.freezes_total(), 1);
    }

    #[test]
    fn freeze_does_not_auto_release_on_edge_recovery() {
        let monitor = RuntimeRiskMonitor::new(cfg());
        monitor.on_edge_update("BTC-USD", 0.1);
        monitor.on_edge_update("BTC-USD", 5.0);
        assert!(monitor.is_frozen());
        monitor.release_freeze();
        assert!(!monitor.is_frozen());
    }

    #[test]
    fn on_fill_updates_inventory_and_notional() {
        let monitor = RuntimeRiskMonitor::new(cfg());
        monitor.on_fill(&FillEvent {
            client_id: 1,
            symbol: "BTC-USD".to_string(),
            side: Side::Buy,
            price: 100.0,
            size: 1.0,
            is_maker: true,
            gross_bps: 0.0,
            fee_bps: 0.0,
            adverse_bps: 0.0,
            slippage_bps: 0.0,
            timestamp_ms: 0,
        });
        let decision = monitor.check_before_order("BTC-USD", Side::Buy, 99.5);
        assert!(!decision.is_allowed());
    }
}
