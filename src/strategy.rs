//! Strategy collaborator (spec §1 Non-goals: "does not implement strategy
//! pricing logic (delegated to a `Strategy` collaborator)"). The core only
//! needs a narrow capability — "what should this symbol quote right now,
//! given the current overrides" — so the trait stays small and the
//! orchestrator depends only on it, never on a concrete pricing model.

use crate::domain::{Order, OrderBookSnapshot, Side};
use std::collections::BTreeMap;

/// One desired resting quote. The orchestrator diffs this set against
/// currently open orders to produce place/cancel intents.
#[derive(Debug, Clone, Copy)]
pub struct DesiredQuote {
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

/// Pricing/quoting collaborator. Implementations receive the live
/// `RuntimeOverrides` map (so a tuned `base_spread_bps_delta` etc. takes
/// effect on the very next tick) but never mutate it.
pub trait Strategy: Send + Sync {
    fn desired_quotes(
        &self,
        book: &OrderBookSnapshot,
        overrides: &BTreeMap<String, f64>,
        open_orders: &[Order],
    ) -> Vec<DesiredQuote>;
}

/// Reference implementation: a single bid/ask pair symmetric around mid,
/// widened by `quoting.base_spread_bps_delta` on top of a fixed base
/// spread. Exists so the orchestrator and its tests have something
/// concrete to drive; production pricing logic is out of scope (spec §1).
pub struct SymmetricQuoteStrategy {
    pub base_spread_bps: f64,
    pub quote_size: f64,
}

impl Default for SymmetricQuoteStrategy {
    fn default() -> Self {
        Self {
            base_spread_bps: 4.0,
            quote_size: 1.0,
        }
    }
}

impl Strategy for SymmetricQuoteStrategy {
    fn desired_quotes(
        &self,
        book: &OrderBookSnapshot,
        overrides: &BTreeMap<String, f64>,
        _open_orders: &[Order],
    ) -> Vec<DesiredQuote> {
        let Some(mid) = book.mid_price() else {
            return Vec::new();
        };
        let delta_bps = overrides
            .get(crate::params::BASE_SPREAD_BPS_DELTA)
            .copied()
            .unwrap_or(0.0);
        let half_spread_bps = (self.base_spread_bps + delta_bps) / 2.0;
        let half_spread = mid * half_spread_bps / 10_000.0;

        vec![
            DesiredQuote {
                side: Side::Buy,
                price: mid - half_spread,
                size: self.quote_size,
            },
            DesiredQuote {
                side: Side::Sell,
                price: mid + half_spread,
                size: self.quote_size,
            },
        ]
    }
}
