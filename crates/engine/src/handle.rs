use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use exchange_core::SharedPriceBook;
use ledger::{PositionLedger, PositionReport};
use model::{CommandOutcome, EngineCommand, EngineEvent, EngineState};
use risk::SharedAccounting;

use crate::supervisor::CommandEnvelope;

/// Synchronous view of the engine for dashboards and the chat-bot.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub positions: Vec<PositionReport>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl_24h: Decimal,
    pub open_order_count: u32,
    pub drawdown: Decimal,
}

/// Cloneable facade handed to external collaborators: commands in,
/// events and snapshots out.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<CommandEnvelope>,
    state_rx: watch::Receiver<EngineState>,
    event_tx: broadcast::Sender<EngineEvent>,
    ledger: Arc<PositionLedger>,
    accounting: SharedAccounting,
    price_book: SharedPriceBook,
}

impl EngineHandle {
    pub fn new(
        command_tx: mpsc::Sender<CommandEnvelope>,
        state_rx: watch::Receiver<EngineState>,
        event_tx: broadcast::Sender<EngineEvent>,
        ledger: Arc<PositionLedger>,
        accounting: SharedAccounting,
        price_book: SharedPriceBook,
    ) -> Self {
        Self {
            command_tx,
            state_rx,
            event_tx,
            ledger,
            accounting,
            price_book,
        }
    }

    /// Send a command and wait for the supervisor's acknowledgement.
    pub async fn command(&self, command: EngineCommand) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = CommandEnvelope {
            command,
            reply: reply_tx,
        };
        if self.command_tx.send(envelope).await.is_err() {
            return CommandOutcome::Denied("supervisor unavailable".into());
        }
        reply_rx
            .await
            .unwrap_or_else(|_| CommandOutcome::Denied("supervisor dropped the command".into()))
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to the engine event bus. Slow subscribers lose oldest
    /// events rather than backpressuring the trading path.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let ledger_snapshot = self
            .ledger
            .snapshot(|pair| self.price_book.quote(pair).map(|q| (q.bid, q.ask)));

        EngineSnapshot {
            state: self.state(),
            positions: ledger_snapshot.positions,
            unrealized_pnl: ledger_snapshot.unrealized_pnl,
            realized_pnl_24h: ledger_snapshot.realized_pnl_24h,
            open_order_count: self.accounting.open_order_count(),
            drawdown: self.accounting.drawdown(),
        }
    }
}
