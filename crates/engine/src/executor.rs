use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use exchange_core::{ExchangeClient, ExchangeError};
use ledger::PositionLedger;
use model::{EngineEvent, Fill, Order};
use risk::SharedAccounting;

/// A submission that has not resolved within this window counts as a
/// transport failure. It is NOT retried: a retry after an opaque timeout
/// risks a double fill.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

const SHARD_CAPACITY: usize = 32;

/// Sole consumer of the approved-order channel and sole holder of the
/// exchange client capability.
///
/// Internally sharded by pair: each pair gets its own worker task, so
/// orders stay strictly FIFO within a pair while a slow submission on one
/// pair never blocks the others.
pub struct OrderExecutor {
    order_rx: mpsc::Receiver<Order>,
    client: Arc<dyn ExchangeClient>,
    ledger: Arc<PositionLedger>,
    accounting: SharedAccounting,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl OrderExecutor {
    pub fn new(
        order_rx: mpsc::Receiver<Order>,
        client: Arc<dyn ExchangeClient>,
        ledger: Arc<PositionLedger>,
        accounting: SharedAccounting,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            order_rx,
            client,
            ledger,
            accounting,
            event_tx,
        }
    }

    pub async fn run(mut self) {
        info!("order executor running");
        let mut shards: HashMap<String, mpsc::Sender<Order>> = HashMap::new();

        while let Some(order) = self.order_rx.recv().await {
            let shard = shards.entry(order.pair.clone()).or_insert_with(|| {
                spawn_pair_worker(
                    self.client.clone(),
                    self.ledger.clone(),
                    self.accounting.clone(),
                    self.event_tx.clone(),
                )
            });
            if shard.send(order).await.is_err() {
                warn!("pair worker terminated unexpectedly");
            }
        }

        warn!("order channel closed, executor exiting");
    }
}

fn spawn_pair_worker(
    client: Arc<dyn ExchangeClient>,
    ledger: Arc<PositionLedger>,
    accounting: SharedAccounting,
    event_tx: broadcast::Sender<EngineEvent>,
) -> mpsc::Sender<Order> {
    let (tx, mut rx) = mpsc::channel::<Order>(SHARD_CAPACITY);
    tokio::spawn(async move {
        while let Some(order) = rx.recv().await {
            execute_order(order, &client, &ledger, &accounting, &event_tx).await;
        }
    });
    tx
}

async fn execute_order(
    order: Order,
    client: &Arc<dyn ExchangeClient>,
    ledger: &Arc<PositionLedger>,
    accounting: &SharedAccounting,
    event_tx: &broadcast::Sender<EngineEvent>,
) {
    info!(
        pair = %order.pair,
        side = %order.side,
        qty = %order.quantity,
        origin = ?order.origin,
        "submitting order"
    );

    let result = match tokio::time::timeout(SUBMIT_TIMEOUT, client.submit_order(&order)).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Transport {
            retryable: false,
            detail: format!("submission timed out after {}s", SUBMIT_TIMEOUT.as_secs()),
        }),
    };

    match result {
        Ok(fill) => {
            info!(
                pair = %fill.pair,
                price = %fill.executed_price,
                qty = %fill.executed_quantity,
                "order filled"
            );
            apply_fill(&fill, ledger, accounting, event_tx).await;
            let _ = event_tx.send(EngineEvent::OrderFilled {
                fill,
                origin: order.origin,
            });
        }
        Err(e) => {
            error!(pair = %order.pair, error = %e, "order submission failed");
            let _ = event_tx.send(EngineEvent::OrderFailed {
                pair: order.pair,
                origin: order.origin,
                reason: e.to_string(),
            });
        }
    }

    accounting.decrement_open_orders();
}

/// Route the fill into the ledger: a fill opposite an open position closes
/// it, anything else opens or merges.
///
/// A persistence failure after a successful exchange fill is fatal for new
/// orders: the in-memory state keeps the fill and the supervisor halts on
/// the divergence event.
async fn apply_fill(
    fill: &Fill,
    ledger: &Arc<PositionLedger>,
    accounting: &SharedAccounting,
    event_tx: &broadcast::Sender<EngineEvent>,
) {
    let closes_existing = ledger.has_open(&fill.pair, fill.side.closing_side());

    let outcome = if closes_existing {
        match ledger.close_on_sell(fill).await {
            Ok(Some(trade)) => {
                accounting.apply_realized(trade.pnl_usd);
                Ok(())
            }
            Ok(None) => ledger.upsert_on_buy(fill).await.map(|_| ()),
            Err(e) => Err(e),
        }
    } else {
        ledger.upsert_on_buy(fill).await.map(|_| ())
    };

    if let Err(e) = outcome {
        error!(
            pair = %fill.pair,
            order_id = %fill.order_id,
            error = %e,
            "fill applied in memory but not persisted"
        );
        let _ = event_tx.send(EngineEvent::PersistenceDivergence {
            detail: format!("fill {} on {} not persisted: {e}", fill.order_id, fill.pair),
        });
    }
}
