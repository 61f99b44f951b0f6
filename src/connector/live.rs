//! Live exchange backend.
//!
//! Wire protocols are explicitly out of scope for this core (spec §1
//! "Deliberately out of scope" — "Exchange wire protocols beyond the
//! abstract connector contract"). This type exists so the polymorphism
//! named in spec §9 (`Live`, `FakeDeterministic`, `Replay`) is complete at
//! the type level; wiring an actual transport in is left to the deployment
//! that has one.

use super::{CancelOutcome, ExchangeConnector, PlaceIntent, PlaceOutcome};
use crate::domain::{ClientId, FillEvent, OrderBookSnapshot};
use async_trait::async_trait;

pub struct LiveConnector {
    _endpoint: String,
}

impl LiveConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            _endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ExchangeConnector for LiveConnector {
    async fn fetch_orderbook(&self, _symbol: &str) -> Result<OrderBookSnapshot, String> {
        Err("live connector wire protocol not implemented in this core".to_string())
    }

    async fn place_batch(
        &self,
        _symbol: &str,
        _orders: &[PlaceIntent],
    ) -> Vec<(ClientId, PlaceOutcome)> {
        Vec::new()
    }

    async fn cancel_batch(
        &self,
        _symbol: &str,
        _client_ids: &[ClientId],
    ) -> Vec<(ClientId, CancelOutcome)> {
        Vec::new()
    }

    async fn drain_fills(&self) -> Vec<FillEvent> {
        Vec::new()
    }
}
