//! Position ledger: the single source of truth for open positions and
//! completed trades.
//!
//! In-memory state sits behind a short-lived `parking_lot` lock (never held
//! across an await); every mutation is written through to SQLite. A store
//! failure after a successful exchange fill keeps the in-memory state and
//! surfaces the error so the caller can raise a persistence-divergence
//! alarm — the ledger itself never rolls a fill back.

mod store;

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use model::{Fill, OrderSide, Position, Trade, TradingMode};
use store::Store;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// One open position per `(pair, side)`; the mode is fixed per ledger.
type PositionKey = (String, OrderSide);

#[derive(Default)]
struct LedgerState {
    positions: HashMap<PositionKey, Position>,
    /// Trailing window of closed trades backing the 24 h realized figure.
    recent_trades: Vec<Trade>,
}

/// An open position paired with its mark-to-market PnL (when a quote is
/// available).
#[derive(Debug, Clone)]
pub struct PositionReport {
    pub position: Position,
    pub unrealized_pnl: Option<Decimal>,
}

/// Lock-light read for dashboards and the snapshot interface.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub positions: Vec<PositionReport>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl_24h: Decimal,
}

pub struct PositionLedger {
    mode: TradingMode,
    state: RwLock<LedgerState>,
    store: Store,
}

impl PositionLedger {
    /// Connect to the store, create the schema if needed, and load the open
    /// set plus the trailing 24 h of trades for this mode.
    pub async fn open(database_url: &str, mode: TradingMode) -> Result<Self, LedgerError> {
        let store = Store::open(database_url).await?;

        let positions = store.load_open_positions(mode).await?;
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let recent_trades = store.load_trades_since(mode, cutoff).await?;

        info!(
            mode = %mode,
            open_positions = positions.len(),
            trades_24h = recent_trades.len(),
            "position ledger loaded"
        );

        let state = LedgerState {
            positions: positions
                .into_iter()
                .map(|p| ((p.pair.clone(), p.side), p))
                .collect(),
            recent_trades,
        };

        Ok(Self {
            mode,
            state: RwLock::new(state),
            store,
        })
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    /// Apply an opening fill: create the position for `(pair, side)` or
    /// merge into the existing one with a volume-weighted entry price.
    pub async fn upsert_on_buy(&self, fill: &Fill) -> Result<String, LedgerError> {
        let position = {
            let mut state = self.state.write();
            let key = (fill.pair.clone(), fill.side);

            match state.positions.get_mut(&key) {
                Some(existing) => {
                    let total = existing.quantity + fill.executed_quantity;
                    existing.entry_price = (existing.entry_price * existing.quantity
                        + fill.executed_price * fill.executed_quantity)
                        / total;
                    existing.quantity = total;
                    existing.clone()
                }
                None => {
                    let position = Position {
                        id: uuid::Uuid::new_v4().to_string(),
                        pair: fill.pair.clone(),
                        side: fill.side,
                        entry_price: fill.executed_price,
                        quantity: fill.executed_quantity,
                        mode: self.mode,
                        opened_at: fill.executed_at,
                    };
                    state.positions.insert(key, position.clone());
                    position
                }
            }
        };

        self.store.save_position(&position).await?;
        info!(
            pair = %position.pair,
            side = %position.side,
            qty = %position.quantity,
            entry = %position.entry_price,
            "position opened"
        );
        Ok(position.id)
    }

    /// Apply a closing fill: compute realized PnL, remove the position and
    /// append the trade atomically. `Ok(None)` when nothing was open on the
    /// opposite side.
    pub async fn close_on_sell(&self, fill: &Fill) -> Result<Option<Trade>, LedgerError> {
        let closed = {
            let mut state = self.state.write();
            let key = (fill.pair.clone(), fill.side.closing_side());

            let Some(position) = state.positions.remove(&key) else {
                return Ok(None);
            };

            let trade = Trade {
                id: uuid::Uuid::new_v4().to_string(),
                pair: position.pair.clone(),
                side: position.side,
                entry_price: position.entry_price,
                exit_price: fill.executed_price,
                quantity: position.quantity,
                pnl_usd: Trade::realized_pnl(
                    position.side,
                    position.entry_price,
                    fill.executed_price,
                    position.quantity,
                ),
                mode: self.mode,
                opened_at: position.opened_at,
                closed_at: fill.executed_at,
            };
            state.recent_trades.push(trade.clone());
            prune_recent(&mut state.recent_trades);
            (position, trade)
        };

        let (position, trade) = closed;
        self.store.close_position(&position.id, &trade).await?;
        info!(
            pair = %trade.pair,
            pnl_usd = %trade.pnl_usd,
            exit = %trade.exit_price,
            "position closed"
        );
        Ok(Some(trade))
    }

    pub fn has_open(&self, pair: &str, side: OrderSide) -> bool {
        self.state
            .read()
            .positions
            .contains_key(&(pair.to_string(), side))
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.state.read().positions.values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.state.read().positions.len()
    }

    /// Total mark-to-market PnL across open positions; pairs without a
    /// quote contribute nothing.
    pub fn unrealized_pnl<F>(&self, quote_fn: F) -> Decimal
    where
        F: Fn(&str) -> Option<(Decimal, Decimal)>,
    {
        self.state
            .read()
            .positions
            .values()
            .filter_map(|p| quote_fn(&p.pair).map(|(bid, ask)| p.unrealized_pnl(bid, ask)))
            .sum()
    }

    pub fn snapshot<F>(&self, quote_fn: F) -> LedgerSnapshot
    where
        F: Fn(&str) -> Option<(Decimal, Decimal)>,
    {
        let mut state = self.state.write();
        prune_recent(&mut state.recent_trades);

        let positions: Vec<PositionReport> = state
            .positions
            .values()
            .map(|p| PositionReport {
                unrealized_pnl: quote_fn(&p.pair).map(|(bid, ask)| p.unrealized_pnl(bid, ask)),
                position: p.clone(),
            })
            .collect();

        let unrealized_pnl = positions
            .iter()
            .filter_map(|r| r.unrealized_pnl)
            .sum();
        let realized_pnl_24h = state.recent_trades.iter().map(|t| t.pnl_usd).sum();

        LedgerSnapshot {
            positions,
            unrealized_pnl,
            realized_pnl_24h,
        }
    }

    /// Idempotent merge against the exchange's view of what is open.
    ///
    /// Exchange-known positions missing locally are adopted (and returned
    /// so the caller can raise orphan warnings); ledger-only positions are
    /// logged as divergence but never deleted without an explicit close
    /// fill.
    pub async fn reconcile(
        &self,
        exchange_positions: Vec<Position>,
    ) -> Result<Vec<Position>, LedgerError> {
        let mut adopted = Vec::new();

        {
            let mut state = self.state.write();

            for remote in exchange_positions.iter() {
                let key = (remote.pair.clone(), remote.side);
                if !state.positions.contains_key(&key) {
                    let mut position = remote.clone();
                    position.mode = self.mode;
                    state.positions.insert(key, position.clone());
                    adopted.push(position);
                }
            }

            for local in state.positions.values() {
                let known_remotely = exchange_positions
                    .iter()
                    .any(|r| r.pair == local.pair && r.side == local.side);
                if !known_remotely {
                    warn!(
                        pair = %local.pair,
                        side = %local.side,
                        "position in ledger but absent from exchange"
                    );
                }
            }
        }

        for position in &adopted {
            warn!(
                pair = %position.pair,
                side = %position.side,
                qty = %position.quantity,
                "adopted exchange position unknown to ledger"
            );
            self.store.save_position(position).await?;
        }

        Ok(adopted)
    }
}

fn prune_recent(trades: &mut Vec<Trade>) {
    let cutoff = Utc::now() - ChronoDuration::hours(24);
    trades.retain(|t| t.closed_at >= cutoff);
}
