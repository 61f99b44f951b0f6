//! Shared domain entities (spec §3 DATA MODEL): `Order`, `Position`,
//! `OrderBookSnapshot`, and the small value types they're built from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ClientId = u64;
pub type ExchangeId = String;
pub type Symbol = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buy, -1 for sell; used to sign inventory deltas.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Order lifecycle state. Transitions are monotone; `Filled`, `Cancelled`,
/// and `Rejected` are absorbing (spec §3 Order invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }

    /// Whether `self -> next` is a legal transition under the monotone
    /// state machine.
    pub fn can_transition_to(self, next: OrderState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (OrderState::Pending, OrderState::Open) => true,
            (OrderState::Pending, OrderState::Rejected) => true,
            (OrderState::Pending, OrderState::Cancelled) => true,
            (OrderState::Open, OrderState::Filled) => true,
            (OrderState::Open, OrderState::Cancelled) => true,
            (OrderState::Open, OrderState::Rejected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_id: ClientId,
    pub exchange_id: Option<ExchangeId>,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub state: OrderState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Order {
    pub fn new(client_id: ClientId, symbol: Symbol, side: Side, price: f64, size: f64, now_ms: i64) -> Self {
        Self {
            client_id,
            exchange_id: None,
            symbol,
            side,
            price,
            size,
            state: OrderState::Pending,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Attempts a state transition, returning `false` (no mutation) if the
    /// transition would violate monotonicity.
    pub fn transition(&mut self, next: OrderState, now_ms: i64) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at_ms = now_ms;
        true
    }
}

/// Per-symbol signed base inventory and cumulative notional, mutated only
/// by fill events or explicit reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub base_amount: f64,
    pub cumulative_notional: f64,
}

impl Position {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            base_amount: 0.0,
            cumulative_notional: 0.0,
        }
    }

    pub fn apply_fill(&mut self, side: Side, price: f64, size: f64) {
        self.base_amount += side.sign() * size;
        self.cumulative_notional += price * size;
    }
}

/// A single resting-book price level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

/// Produced by the connector each tick; consumed read-only by the
/// Strategy. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub last_trade_price: Option<f64>,
    pub timestamp_ms: i64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid <= 0.0 {
            return None;
        }
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some(((ask - bid) / mid) * 10_000.0)
    }
}

/// A connector-reported fill event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub client_id: ClientId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub is_maker: bool,
    /// Captured edge versus mid at fill time, unsigned convention (spec
    /// §4.4 `net_bps`: `gross≥0`). Fed into `gross_bps_samples`.
    pub gross_bps: f64,
    /// Raw fee rate magnitude; the Watcher forces this negative at ingest
    /// regardless of sign convention upstream (spec §4.4).
    pub fee_bps: f64,
    pub adverse_bps: f64,
    pub slippage_bps: f64,
    pub timestamp_ms: i64,
}

/// Owns `Order` records for their lifetime plus a retention window past
/// terminal state (spec §3 ownership). Exposes only short critical
/// sections: callers never hold the lock across a suspension point.
#[derive(Debug, Default)]
pub struct OrderStore {
    orders: parking_lot::RwLock<HashMap<ClientId, Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: Order) {
        self.orders.write().insert(order.client_id, order);
    }

    pub fn get(&self, client_id: ClientId) -> Option<Order> {
        self.orders.read().get(&client_id).cloned()
    }

    /// Applies a state transition, returning whether it was legal.
    pub fn transition(&self, client_id: ClientId, next: OrderState, now_ms: i64) -> bool {
        let mut guard = self.orders.write();
        match guard.get_mut(&client_id) {
            Some(order) => order.transition(next, now_ms),
            None => false,
        }
    }

    pub fn open_orders_for_symbol(&self, symbol: &str) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.symbol == symbol && !o.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Evicts orders that reached a terminal state at or before
    /// `now_ms - retention_ms`.
    pub fn evict_expired(&self, now_ms: i64, retention_ms: i64) {
        self.orders.write().retain(|_, o| {
            !o.state.is_terminal() || now_ms - o.updated_at_ms < retention_ms
        });
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single owner of position state; subscribes to fill events rather than
/// having `Order` hold a back-reference to `Position` (spec §9).
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: parking_lot::RwLock<HashMap<Symbol, Position>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fill(&self, fill: &FillEvent) {
        let mut guard = self.positions.write();
        let position = guard
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(fill.symbol.clone()));
        position.apply_fill(fill.side, fill.price, fill.size);
    }

    pub fn position(&self, symbol: &str) -> Position {
        self.positions
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::new(symbol.to_string()))
    }

    pub fn total_notional(&self) -> f64 {
        self.positions
            .read()
            .values()
            .map(|p| p.base_amount.abs() * 1.0)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_state_machine_is_monotone() {
        let mut order = Order::new(1, "BTC-USD".into(), Side::Buy, 100.0, 1.0, 0);
        assert!(order.transition(OrderState::Open, 1));
        assert!(order.transition(OrderState::Filled, 2));
        // Terminal: further transitions are rejected.
        assert!(!order.transition(OrderState::Cancelled, 3));
        assert_eq!(order.state, OrderState::Filled);
    }

    #[test]
    fn order_store_evicts_only_past_retention_window() {
        let store = OrderStore::new();
        store.insert(Order::new(1, "BTC-USD".into(), Side::Buy, 100.0, 1.0, 0));
        store.transition(1, OrderState::Open, 0);
        store.transition(1, OrderState::Filled, 10);

        store.evict_expired(15, 100);
        assert_eq!(store.len(), 1);

        store.evict_expired(200, 100);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn position_tracker_is_sole_mutator() {
        let tracker = PositionTracker::new();
        tracker.on_fill(&FillEvent {
            client_id: 1,
            symbol: "ETH-USD".into(),
            side: Side::Buy,
            price: 2000.0,
            size: 2.0,
            is_maker: true,
            gross_bps: 1.5,
            fee_bps: 0.8,
            adverse_bps: 1.0,
            slippage_bps: 0.5,
            timestamp_ms: 0,
        });
        let position = tracker.position("ETH-USD");
        assert!((position.base_amount - 2.0).abs() < 1e-9);
        assert!((position.cumulative_notional - 4000.0).abs() < 1e-9);
    }

    #[test]
    fn spread_bps_matches_best_bid_ask() {
        let book = OrderBookSnapshot {
            symbol: "BTC-USD".into(),
            bids: vec![Level { price: 99.0, size: 1.0 }],
            asks: vec![Level { price: 101.0, size: 1.0 }],
            last_trade_price: Some(100.0),
            timestamp_ms: 0,
        };
        assert_eq!(book.mid_price(), Some(100.0));
        assert!((book.spread_bps().unwrap() - 200.0).abs() < 1e-6);
    }
}
