use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use model::{OrderSide, Position, Trade, TradingMode};

use crate::LedgerError;

/// SQLite persistence behind the position ledger.
///
/// Decimals are stored as TEXT to keep them exact; timestamps as RFC 3339
/// TEXT via sqlx's chrono support.
pub(crate) struct Store {
    pool: SqlitePool,
}

impl Store {
    pub(crate) async fn open(database_url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(LedgerError::Database)?
            .create_if_missing(true);

        // A single connection keeps `:memory:` databases coherent across
        // pool checkouts; this workload serializes on SQLite anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                mode TEXT NOT NULL,
                opened_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                pnl_usd TEXT NOT NULL,
                mode TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_trades_pair ON trades (pair)",
            "CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades (closed_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_trades_mode ON trades (mode)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    pub(crate) async fn save_position(&self, position: &Position) -> Result<(), LedgerError> {
        sqlx::query(
            r"
            INSERT INTO positions (id, pair, side, entry_price, quantity, mode, opened_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                entry_price = excluded.entry_price,
                quantity = excluded.quantity
            ",
        )
        .bind(&position.id)
        .bind(&position.pair)
        .bind(position.side.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.quantity.to_string())
        .bind(position.mode.to_string())
        .bind(position.opened_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove the position and append the trade in one transaction, so a
    /// close fill is either fully persisted or not at all.
    pub(crate) async fn close_position(
        &self,
        position_id: &str,
        trade: &Trade,
    ) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM positions WHERE id = ?1")
            .bind(position_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"
            INSERT INTO trades
                (id, pair, side, entry_price, exit_price, quantity, pnl_usd, mode, opened_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(&trade.id)
        .bind(&trade.pair)
        .bind(trade.side.to_string())
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.pnl_usd.to_string())
        .bind(trade.mode.to_string())
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn load_open_positions(
        &self,
        mode: TradingMode,
    ) -> Result<Vec<Position>, LedgerError> {
        type PositionRow = (String, String, String, String, String, DateTime<Utc>);

        let rows: Vec<PositionRow> = sqlx::query_as(
            r"
            SELECT id, pair, side, entry_price, quantity, opened_at
            FROM positions
            WHERE mode = ?1
            ",
        )
        .bind(mode.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, pair, side, entry_price, quantity, opened_at)| {
                Ok(Position {
                    id,
                    pair,
                    side: parse_stored(&side)?,
                    entry_price: parse_decimal(&entry_price)?,
                    quantity: parse_decimal(&quantity)?,
                    mode,
                    opened_at,
                })
            })
            .collect()
    }

    pub(crate) async fn load_trades_since(
        &self,
        mode: TradingMode,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Trade>, LedgerError> {
        type TradeRow = (
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            DateTime<Utc>,
            DateTime<Utc>,
        );

        let rows: Vec<TradeRow> = sqlx::query_as(
            r"
            SELECT id, pair, side, entry_price, exit_price, quantity, pnl_usd, opened_at, closed_at
            FROM trades
            WHERE mode = ?1 AND closed_at >= ?2
            ORDER BY closed_at DESC
            ",
        )
        .bind(mode.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, pair, side, entry, exit, quantity, pnl, opened_at, closed_at)| {
                    Ok(Trade {
                        id,
                        pair,
                        side: parse_stored(&side)?,
                        entry_price: parse_decimal(&entry)?,
                        exit_price: parse_decimal(&exit)?,
                        quantity: parse_decimal(&quantity)?,
                        pnl_usd: parse_decimal(&pnl)?,
                        mode,
                        opened_at,
                        closed_at,
                    })
                },
            )
            .collect()
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(raw).map_err(|e| LedgerError::Corrupt(format!("decimal '{raw}': {e}")))
}

fn parse_stored(raw: &str) -> Result<OrderSide, LedgerError> {
    OrderSide::from_str(raw).map_err(LedgerError::Corrupt)
}
