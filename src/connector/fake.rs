//! Deterministic fake exchange backend (spec §4.2): seeded RNG drives fill
//! and reject probability; timestamps come from [`crate::clock::WallClock`]
//! so a frozen run is byte-identical across executions.

use super::{CancelOutcome, ExchangeConnector, PlaceIntent, PlaceOutcome};
use crate::clock::WallClock;
use crate::domain::{ClientId, ExchangeId, FillEvent, Level, OrderBookSnapshot, Side};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

struct FakeState {
    rng: ChaCha8Rng,
    mid_prices: HashMap<String, f64>,
    pending_fills: Vec<FillEvent>,
    next_exchange_id: u64,
}

/// Fully deterministic connector driven by a seeded `ChaCha8Rng`, for tests
/// and soak runs without a live exchange. Fill probability, reject
/// probability, and price drift are all functions of the seed; two runs
/// with the same seed and frozen clock produce the same fill stream.
pub struct FakeDeterministicConnector {
    state: Mutex<FakeState>,
    clock: WallClock,
    fill_probability: f64,
    reject_probability: f64,
    maker_probability: f64,
}

impl FakeDeterministicConnector {
    pub fn new(seed: u64, symbols: &[String]) -> Self {
        let mut mid_prices = HashMap::new();
        for (i, symbol) in symbols.iter().enumerate() {
            mid_prices.insert(symbol.clone(), 100.0 + (i as f64) * 10.0);
        }
        Self {
            state: Mutex::new(FakeState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                mid_prices,
                pending_fills: Vec::new(),
                next_exchange_id: 1,
            }),
            clock: WallClock::from_env(),
            fill_probability: 0.35,
            reject_probability: 0.02,
            maker_probability: 0.85,
        }
    }

    pub fn with_probabilities(mut self, fill_probability: f64, reject_probability: f64) -> Self {
        self.fill_probability = fill_probability;
        self.reject_probability = reject_probability;
        self
    }

    pub fn with_maker_probability(mut self, maker_probability: f64) -> Self {
        self.maker_probability = maker_probability;
        self
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

#[async_trait]
impl ExchangeConnector for FakeDeterministicConnector {
    async fn fetch_orderbook(&self, symbol: &str) -> Result<OrderBookSnapshot, String> {
        let mut state = self.state.lock();
        let now_ms = self.now_ms();
        let drift: f64 = state.rng.gen_range(-0.05..0.05);
        let mid = state
            .mid_prices
            .entry(symbol.to_string())
            .and_modify(|p| *p = (*p + drift).max(0.01))
            .or_insert(100.0);
        let mid = *mid;
        let half_spread = (mid * 0.0005).max(0.001);
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: vec![Level {
                price: mid - half_spread,
                size: 10.0,
            }],
            asks: vec![Level {
                price: mid + half_spread,
                size: 10.0,
            }],
            last_trade_price: Some(mid),
            timestamp_ms: now_ms,
        })
    }

    async fn place_batch(
        &self,
        symbol: &str,
        orders: &[PlaceIntent],
    ) -> Vec<(ClientId, PlaceOutcome)> {
        let mut state = self.state.lock();
        let now_ms = self.now_ms();
        let mut results = Vec::with_capacity(orders.len());
        for intent in orders {
            let reject: f64 = state.rng.gen_range(0.0..1.0);
            if reject < self.reject_probability {
                results.push((intent.client_id, PlaceOutcome::Error("rejected".into())));
                continue;
            }
            let exchange_id: ExchangeId = format!("fake-{}", state.next_exchange_id);
            state.next_exchange_id += 1;
            let fill_roll: f64 = state.rng.gen_range(0.0..1.0);
            if fill_roll < self.fill_probability {
                let adverse_bps = state.rng.gen_range(0.0..6.0);
                let slippage_bps = state.rng.gen_range(-1.0..3.0);
                let maker_roll: f64 = state.rng.gen_range(0.0..1.0);
                let is_maker = maker_roll < self.maker_probability;

                // Gross edge captured versus mid (spec §4.4 sign
                // convention: gross >= 0). Maker fills capture the quoted
                // half-spread plus a little noise; taker fills capture
                // less (they cross the book to get filled).
                let mid = *state.mid_prices.get(symbol).unwrap_or(&intent.price);
                let captured_bps = if mid > 0.0 {
                    ((intent.price - mid).abs() / mid) * 10_000.0
                } else {
                    0.0
                };
                let noise: f64 = state.rng.gen_range(0.0..0.5);
                let gross_bps = (captured_bps + noise).max(0.0);

                // Maker fills earn a rebate-sized fee; taker fills pay a
                // larger one. `fee_bps` is the raw magnitude — the Watcher
                // forces it negative at ingest (spec §4.4).
                let fee_bps = if is_maker {
                    state.rng.gen_range(0.2..1.0)
                } else {
                    state.rng.gen_range(1.5..3.5)
                };

                state.pending_fills.push(FillEvent {
                    client_id: intent.client_id,
                    symbol: symbol.to_string(),
                    side: intent.side,
                    price: intent.price,
                    size: intent.size,
                    is_maker,
                    gross_bps,
                    fee_bps,
                    adverse_bps,
                    slippage_bps,
                    timestamp_ms: now_ms,
                });
            }
            results.push((intent.client_id, PlaceOutcome::Accepted(exchange_id)));
        }
        results
    }

    async fn cancel_batch(
        &self,
        _symbol: &str,
        client_ids: &[ClientId],
    ) -> Vec<(ClientId, CancelOutcome)> {
        client_ids.iter().map(|&id| (id, CancelOutcome::Ok)).collect()
    }

    async fn drain_fills(&self) -> Vec<FillEvent> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.pending_fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_seed_produces_same_orderbook_sequence() {
        std::env::set_var("MM_FREEZE_UTC_ISO", "2026-01-01T00:00:00Z");
        let symbols = vec!["BTC-USD".to_string()];
        let a = FakeDeterministicConnector::new(7, &symbols);
        let b = FakeDeterministicConnector::new(7, &symbols);

        let snap_a = a.fetch_orderbook("BTC-USD").await.unwrap();
        let snap_b = b.fetch_orderbook("BTC-USD").await.unwrap();
        std::env::remove_var("MM_FREEZE_UTC_ISO");

        assert_eq!(snap_a.timestamp_ms, snap_b.timestamp_ms);
        assert!((snap_a.mid_price().unwrap() - snap_b.mid_price().unwrap()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn place_batch_reports_per_element_outcomes() {
        let symbols = vec!["ETH-USD".to_string()];
        let connector = FakeDeterministicConnector::new(1, &symbols).with_probabilities(0.0, 0.0);
        let orders = vec![PlaceIntent {
            client_id: 1,
            side: Side::Buy,
            price: 100.0,
            size: 1.0,
        }];
        let outcomes = connector.place_batch("ETH-USD", &orders).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].1, PlaceOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn all_reject_probability_rejects_every_order() {
        let symbols = vec!["ETH-USD".to_string()];
        let connector = FakeDeterministicConnector::new(1, &symbols).with_probabilities(0.0, 1.0);
        let orders = vec![PlaceIntent {
            client_id: 1,
            side: Side::Buy,
            price: 100.0,
            size: 1.0,
        }];
        let outcomes = connector.place_batch("ETH-USD", &orders).await;
        assert!(matches!(outcomes[0].1, PlaceOutcome::Error(_)));
    }
}
