//! Replay backend: plays back a pre-recorded, pre-sorted snapshot/fill
//! sequence (spec §9 "variants include `Live`, `FakeDeterministic`,
//! `Replay`"). Each symbol's cursor advances independently and restarts
//! from its beginning on resubscription, matching the "lazy, infinite,
//! non-restartable sequence must survive resubscription" requirement by
//! treating a restart as a fresh cursor rather than an error.

use super::{CancelOutcome, ExchangeConnector, PlaceIntent, PlaceOutcome};
use crate::domain::{ClientId, FillEvent, OrderBookSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Cursor {
    position: usize,
}

/// A fixture connector that replays recorded snapshots; places/cancels are
/// accepted unconditionally (no fill side-effects) since recorded fixtures
/// drive determinism via the orderbook stream, not synthetic fills.
pub struct ReplayConnector {
    recordings: HashMap<String, Vec<OrderBookSnapshot>>,
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl ReplayConnector {
    pub fn new(recordings: HashMap<String, Vec<OrderBookSnapshot>>) -> Self {
        Self {
            recordings,
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ExchangeConnector for ReplayConnector {
    async fn fetch_orderbook(&self, symbol: &str) -> Result<OrderBookSnapshot, String> {
        let Some(sequence) = self.recordings.get(symbol) else {
            return Err(format!("no recording for symbol {symbol}"));
        };
        if sequence.is_empty() {
            return Err(format!("empty recording for symbol {symbol}"));
        }
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(symbol.to_string()).or_default();
        // Restart from the beginning once the recording is exhausted,
        // modeling "resubscription restarts the sequence from a new
        // cursor" rather than terminating the stream.
        if cursor.position >= sequence.len() {
            cursor.position = 0;
        }
        let snapshot = sequence[cursor.position].clone();
        cursor.position += 1;
        Ok(snapshot)
    }

    async fn place_batch(
        &self,
        _symbol: &str,
        orders: &[PlaceIntent],
    ) -> Vec<(ClientId, PlaceOutcome)> {
        orders
            .iter()
            .map(|o| (o.client_id, PlaceOutcome::Accepted(format!("replay-{}", o.client_id))))
            .collect()
    }

    async fn cancel_batch(
        &self,
        _symbol: &str,
        client_ids: &[ClientId],
    ) -> Vec<(ClientId, CancelOutcome)> {
        client_ids.iter().map(|&id| (id, CancelOutcome::Ok)).collect()
    }

    async fn drain_fills(&self) -> Vec<FillEvent> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Level;

    fn snapshot(symbol: &str, ts: i64, mid: f64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: vec![Level { price: mid - 0.5, size: 1.0 }],
            asks: vec![Level { price: mid + 0.5, size: 1.0 }],
            last_trade_price: Some(mid),
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn replay_restarts_cursor_after_exhaustion() {
        let mut recordings = HashMap::new();
        recordings.insert(
            "BTC-USD".to_string(),
            vec![snapshot("BTC-USD", 1, 100.0), snapshot("BTC-USD", 2, 101.0)],
        );
        let connector = ReplayConnector::new(recordings);

        let first = connector.fetch_orderbook("BTC-USD").await.unwrap();
        let second = connector.fetch_orderbook("BTC-USD").await.unwrap();
        let third = connector.fetch_orderbook("BTC-USD").await.unwrap();

        assert_eq!(first.timestamp_ms, 1);
        assert_eq!(second.timestamp_ms, 2);
        assert_eq!(third.timestamp_ms, 1);
    }

    #[tokio::test]
    async fn unknown_symbol_is_an_error_not_a_panic() {
        let connector = ReplayConnector::new(HashMap::new());
        assert!(connector.fetch_orderbook("XRP-USD").await.is_err());
    }
}
