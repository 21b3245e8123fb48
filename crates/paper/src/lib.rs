//! Simulated exchange client for paper trading.
//!
//! Fills synchronously against the shared price book: buys at
//! `ask × (1 + slippage_bps / 10_000)`, sells at
//! `bid × (1 − slippage_bps / 10_000)`. Transport never fails; the only
//! error is a missing quote for the pair. The rest of the pipeline cannot
//! tell this client from the live one.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use exchange_core::{ExchangeClient, ExchangeError, SharedPriceBook};
use model::{Fill, Order, OrderSide, Position, TradingMode};

const BPS_DENOMINATOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

pub struct PaperClient {
    price_book: SharedPriceBook,
    slippage_bps: Decimal,
    /// The simulation's own idea of what is open at the "exchange", so the
    /// reconnect audit exercises the same path as live trading.
    positions: RwLock<Vec<Position>>,
}

impl PaperClient {
    pub fn new(price_book: SharedPriceBook, slippage_bps: Decimal) -> Self {
        Self {
            price_book,
            slippage_bps,
            positions: RwLock::new(Vec::new()),
        }
    }

    fn fill_price(&self, side: OrderSide, bid: Decimal, ask: Decimal) -> Decimal {
        let offset = self.slippage_bps / BPS_DENOMINATOR;
        match side {
            OrderSide::Buy => ask * (Decimal::ONE + offset),
            OrderSide::Sell => bid * (Decimal::ONE - offset),
        }
    }

    fn record_fill(&self, order: &Order, price: Decimal) {
        let mut positions = self.positions.write();

        // A fill on the opposite side closes; otherwise it opens or merges,
        // keeping one position per (pair, side).
        if let Some(index) = positions
            .iter()
            .position(|p| p.pair == order.pair && p.side == order.side.closing_side())
        {
            positions.remove(index);
            return;
        }

        if let Some(existing) = positions
            .iter_mut()
            .find(|p| p.pair == order.pair && p.side == order.side)
        {
            let total = existing.quantity + order.quantity;
            existing.entry_price =
                (existing.entry_price * existing.quantity + price * order.quantity) / total;
            existing.quantity = total;
            return;
        }

        positions.push(Position {
            id: order.id.clone(),
            pair: order.pair.clone(),
            side: order.side,
            entry_price: price,
            quantity: order.quantity,
            mode: TradingMode::Paper,
            opened_at: Utc::now(),
        });
    }
}

#[async_trait]
impl ExchangeClient for PaperClient {
    async fn submit_order(&self, order: &Order) -> Result<Fill, ExchangeError> {
        let quote = self
            .price_book
            .quote(&order.pair)
            .ok_or_else(|| ExchangeError::Rejected {
                reason: format!("no quote for pair '{}'", order.pair),
            })?;

        let price = self.fill_price(order.side, quote.bid, quote.ask);
        debug!(
            pair = %order.pair,
            side = %order.side,
            qty = %order.quantity,
            fill = %price,
            "paper fill"
        );

        self.record_fill(order, price);

        Ok(Fill {
            order_id: order.id.clone(),
            pair: order.pair.clone(),
            side: order.side,
            executed_price: price,
            executed_quantity: order.quantity,
            executed_at: Utc::now(),
            exchange_id: Some(format!("paper-{}", uuid::Uuid::new_v4())),
        })
    }

    async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.positions.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange_core::create_price_book;
    use model::{MarketEvent, OrderOrigin};
    use rust_decimal_macros::dec;

    fn client_with_quote(pair: &str, bid: Decimal, ask: Decimal, slippage_bps: Decimal) -> PaperClient {
        let book = create_price_book();
        book.update(&MarketEvent {
            pair: pair.into(),
            timestamp: Utc::now(),
            bid,
            ask,
            last: bid,
            volume: None,
        });
        PaperClient::new(book, slippage_bps)
    }

    fn market_order(pair: &str, side: OrderSide, qty: Decimal) -> Order {
        Order::market(pair, side, qty, dec!(0), Some(OrderOrigin::Strategy))
    }

    #[tokio::test]
    async fn test_buy_fills_at_ask_plus_slippage() {
        let client = client_with_quote("BTCUSDT", dec!(19990), dec!(20000), dec!(10));
        let fill = client
            .submit_order(&market_order("BTCUSDT", OrderSide::Buy, dec!(0.04)))
            .await
            .unwrap();

        assert_eq!(fill.executed_price, dec!(20020));
        assert_eq!(fill.executed_quantity, dec!(0.04));
    }

    #[tokio::test]
    async fn test_sell_fills_at_bid_minus_slippage() {
        let client = client_with_quote("BTCUSDT", dec!(20000), dec!(20010), dec!(10));
        client
            .submit_order(&market_order("BTCUSDT", OrderSide::Buy, dec!(0.04)))
            .await
            .unwrap();

        let fill = client
            .submit_order(&market_order("BTCUSDT", OrderSide::Sell, dec!(0.04)))
            .await
            .unwrap();
        assert_eq!(fill.executed_price, dec!(19980));
    }

    #[tokio::test]
    async fn test_missing_quote_is_rejected_not_transport() {
        let client = PaperClient::new(create_price_book(), dec!(10));
        let err = client
            .submit_order(&market_order("DOGEUSDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip_clears_position() {
        let client = client_with_quote("ETHUSDT", dec!(1500), dec!(1501), dec!(0));

        client
            .submit_order(&market_order("ETHUSDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        assert_eq!(client.open_positions().await.unwrap().len(), 1);

        client
            .submit_order(&market_order("ETHUSDT", OrderSide::Sell, dec!(1)))
            .await
            .unwrap();
        assert!(client.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_buys_merge_with_weighted_entry() {
        let client = client_with_quote("ETHUSDT", dec!(1000), dec!(1000), dec!(0));
        client
            .submit_order(&market_order("ETHUSDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();

        // Reprice and buy again
        client.price_book.update(&MarketEvent {
            pair: "ETHUSDT".into(),
            timestamp: Utc::now(),
            bid: dec!(2000),
            ask: dec!(2000),
            last: dec!(2000),
            volume: None,
        });
        client
            .submit_order(&market_order("ETHUSDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();

        let positions = client.open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(2));
        assert_eq!(positions[0].entry_price, dec!(1500));
    }
}
