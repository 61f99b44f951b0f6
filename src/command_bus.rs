//! Command Bus (spec §2, §4.3, §9): coalesces per-symbol place/cancel
//! intents raised during a tick into batched exchange calls. One
//! crossbeam channel pair per symbol (cancel queue, place queue), drained
//! at tick boundaries — the "channels/queues... drained at tick
//! boundaries" design note in spec §9.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;

use crate::connector::PlaceIntent;
use crate::domain::ClientId;

/// Splits `items` into chunks of at most `max_size`, preserving order.
/// `max_size` of zero degrades to one-item chunks rather than looping
/// forever (defensive against a misconfigured `max_batch_size`).
fn chunk<T>(items: Vec<T>, max_size: usize) -> Vec<Vec<T>> {
    let max_size = max_size.max(1);
    if items.is_empty() {
        return Vec::new();
    }
    items.chunks(max_size).map(|c| c.to_vec()).collect()
}

/// Coalesced intents for one symbol, one tick: cancels split only if they
/// exceed the batch size, places split into `ceil(count / max_batch_size)`
/// chunks (spec §4.3 "Command coalescing"). Cancels are ordered ahead of
/// places — the caller dispatches `cancel_chunks` before `place_chunks`.
#[derive(Debug, Clone)]
pub struct CommandBatch {
    pub symbol: String,
    pub cancel_chunks: Vec<Vec<ClientId>>,
    pub place_chunks: Vec<Vec<PlaceIntent>>,
}

impl CommandBatch {
    pub fn is_empty(&self) -> bool {
        self.cancel_chunks.is_empty() && self.place_chunks.is_empty()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_chunks.iter().map(Vec::len).sum()
    }

    pub fn place_count(&self) -> usize {
        self.place_chunks.iter().map(Vec::len).sum()
    }

    /// Total exchange calls this batch costs: spec §8 "exchange is called
    /// <= 1 + ceil(P/20) times" for C cancels and P places on one symbol.
    pub fn call_count(&self) -> usize {
        let cancel_calls = if self.cancel_chunks.is_empty() { 0 } else { 1 };
        cancel_calls + self.place_chunks.len()
    }
}

struct SymbolQueues {
    cancel_tx: Sender<ClientId>,
    cancel_rx: Receiver<ClientId>,
    place_tx: Sender<PlaceIntent>,
    place_rx: Receiver<PlaceIntent>,
}

/// Per-process command bus. One instance is shared across the worker pool
/// for the duration of an iteration; `drain` is called once per symbol per
/// tick by the orchestrator's per-symbol worker.
pub struct CommandBus {
    queues: HashMap<String, SymbolQueues>,
    max_batch_size: usize,
    coalescing_enabled: bool,
}

impl CommandBus {
    pub fn new(symbols: &[String], max_batch_size: usize, coalescing_enabled: bool) -> Self {
        let mut queues = HashMap::new();
        for symbol in symbols {
            let (cancel_tx, cancel_rx) = unbounded();
            let (place_tx, place_rx) = unbounded();
            queues.insert(
                symbol.clone(),
                SymbolQueues {
                    cancel_tx,
                    cancel_rx,
                    place_tx,
                    place_rx,
                },
            );
        }
        Self {
            queues,
            max_batch_size,
            coalescing_enabled,
        }
    }

    pub fn enqueue_cancel(&self, symbol: &str, client_id: ClientId) {
        if let Some(q) = self.queues.get(symbol) {
            let _ = q.cancel_tx.send(client_id);
        }
    }

    pub fn enqueue_place(&self, symbol: &str, intent: PlaceIntent) {
        if let Some(q) = self.queues.get(symbol) {
            let _ = q.place_tx.send(intent);
        }
    }

    /// Drains every intent currently queued for `symbol` into one
    /// `CommandBatch`. When coalescing is disabled (legacy mode, spec
    /// §4.3), every intent gets its own chunk — i.e. batch size 1 — for
    /// rollback parity rather than grouping them.
    pub fn drain(&self, symbol: &str) -> CommandBatch {
        let Some(q) = self.queues.get(symbol) else {
            return CommandBatch {
                symbol: symbol.to_string(),
                cancel_chunks: Vec::new(),
                place_chunks: Vec::new(),
            };
        };
        let cancels: Vec<ClientId> = q.cancel_rx.try_iter().collect();
        let places: Vec<PlaceIntent> = q.place_rx.try_iter().collect();

        let effective_batch_size = if self.coalescing_enabled {
            self.max_batch_size
        } else {
            1
        };

        CommandBatch {
            symbol: symbol.to_string(),
            cancel_chunks: chunk(cancels, effective_batch_size),
            place_chunks: chunk(places, effective_batch_size),
        }
    }
}
