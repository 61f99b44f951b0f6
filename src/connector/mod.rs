//! Exchange Connector (spec §4.2, §9): the abstract contract every backend
//! — live, fake, replay — implements. Passed explicitly to the
//! orchestrator as a parameter; nothing here relies on ambient state.

mod fake;
mod live;
mod replay;

pub use fake::FakeDeterministicConnector;
pub use live::LiveConnector;
pub use replay::ReplayConnector;

use crate::domain::{ClientId, ExchangeId, FillEvent, OrderBookSnapshot, Side, Symbol};
use async_trait::async_trait;

/// One place-order intent, as dispatched by the Command Bus.
#[derive(Debug, Clone)]
pub struct PlaceIntent {
    pub client_id: ClientId,
    pub side: Side,
    pub price: f64,
    pub size: f64,
}

/// Per-element result of a batched call: the caller never sees a whole-batch
/// exception for element-level failures (spec §4.2 "atomic per symbol from
/// the caller's perspective").
#[derive(Debug, Clone)]
pub enum PlaceOutcome {
    Accepted(ExchangeId),
    Error(String),
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Ok,
    Error(String),
}

/// Capability set required of any exchange backend (spec §4.2, §9).
/// `stream_orderbook`/`stream_fills` are modeled as async polls rather than
/// `Stream` trait objects to keep the trait object-safe and dyn-friendly —
/// callers that want a continuous feed simply poll in a loop, matching how
/// the orchestrator's tick loop already works.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Fetches the current snapshot for one symbol. A lazy, infinite,
    /// non-restartable stream is modeled as "call again next tick"; a
    /// resubscription (post-gap) restarts from a fresh cursor transparently.
    async fn fetch_orderbook(&self, symbol: &str) -> Result<OrderBookSnapshot, String>;

    /// Places up to 20 orders for one symbol in a single batched call.
    async fn place_batch(
        &self,
        symbol: &str,
        orders: &[PlaceIntent],
    ) -> Vec<(ClientId, PlaceOutcome)>;

    /// Cancels up to 20 client ids for one symbol in a single batched call.
    async fn cancel_batch(
        &self,
        symbol: &str,
        client_ids: &[ClientId],
    ) -> Vec<(ClientId, CancelOutcome)>;

    /// Drains whatever fills have arrived since the last call.
    async fn drain_fills(&self) -> Vec<FillEvent>;

    /// Maximum place/cancel ids accepted per batched call.
    fn max_batch_size(&self) -> usize {
        20
    }
}

pub type Symbols = Vec<Symbol>;
