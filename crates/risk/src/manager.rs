use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use exchange_core::SharedPriceBook;
use ledger::PositionLedger;
use model::{
    EngineEvent, EngineState, MarketEvent, Order, OrderOrigin, OrderSide, Position,
    RejectionReason, Signal, TriggerKind,
};

use crate::accounting::SharedAccounting;
use crate::config::RiskConfig;
use crate::{RiskControl, MAX_OPEN_ORDERS};

/// Internal circuit-breaker substate. Distinct from the engine-level
/// state: a halt blocks new exposure but not the exit of existing
/// exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Substate {
    Normal,
    Halted,
}

enum Verdict {
    Approved(Order),
    Rejected(RejectionReason, String),
    /// Paused or stopped engines swallow signals without an event.
    Dropped,
}

/// The gatekeeper between the strategy layer and the order executor.
///
/// Consumes strategy signals and market events; produces approved orders,
/// rejection events, and stop/take-profit/drawdown triggers. The order
/// channel has no other producer.
pub struct RiskManager {
    config: RiskConfig,
    substate: Substate,
    ledger: Arc<PositionLedger>,
    price_book: SharedPriceBook,
    accounting: SharedAccounting,
    state_rx: watch::Receiver<EngineState>,
    signal_rx: mpsc::Receiver<Signal>,
    control_rx: mpsc::Receiver<RiskControl>,
    market_rx: broadcast::Receiver<MarketEvent>,
    /// Own subscription to the event bus, used to unblock retriggering
    /// after a failed protective close.
    event_rx: broadcast::Receiver<EngineEvent>,
    order_tx: mpsc::Sender<Order>,
    event_tx: broadcast::Sender<EngineEvent>,
    /// Positions with a protective close in flight; cleared when the
    /// position leaves the ledger or its close order fails.
    pending_closes: HashSet<String>,
}

impl RiskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RiskConfig,
        ledger: Arc<PositionLedger>,
        price_book: SharedPriceBook,
        accounting: SharedAccounting,
        state_rx: watch::Receiver<EngineState>,
        signal_rx: mpsc::Receiver<Signal>,
        control_rx: mpsc::Receiver<RiskControl>,
        market_rx: broadcast::Receiver<MarketEvent>,
        event_rx: broadcast::Receiver<EngineEvent>,
        order_tx: mpsc::Sender<Order>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            config,
            substate: Substate::Normal,
            ledger,
            price_book,
            accounting,
            state_rx,
            signal_rx,
            control_rx,
            market_rx,
            event_rx,
            order_tx,
            event_tx,
            pending_closes: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        info!("risk manager running");
        loop {
            tokio::select! {
                biased;

                control = self.control_rx.recv() => match control {
                    Some(control) => self.handle_control(control).await,
                    None => {
                        warn!("control channel closed, risk manager exiting");
                        return;
                    }
                },

                signal = self.signal_rx.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        warn!("signal channel closed, risk manager exiting");
                        return;
                    }
                },

                event = self.market_rx.recv() => match event {
                    Ok(event) => self.handle_market_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "risk manager lagged behind the market bus");
                        let _ = self.event_tx.send(EngineEvent::LaggedConsumer {
                            subscriber: "risk-manager",
                            dropped,
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("market bus closed, risk manager exiting");
                        return;
                    }
                },

                event = self.event_rx.recv() => match event {
                    Ok(EngineEvent::OrderFailed { pair, origin, .. })
                        if matches!(
                            origin,
                            Some(OrderOrigin::StopLoss) | Some(OrderOrigin::TakeProfit)
                        ) =>
                    {
                        self.clear_pending_for_pair(&pair);
                    }
                    Ok(_) => {}
                    // Our own bus subscription may lag; nothing to replay.
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("event bus closed, risk manager exiting");
                        return;
                    }
                },
            }
        }
    }

    // ── Signal path ─────────────────────────────────────────────────────

    async fn handle_signal(&mut self, signal: Signal) {
        match self.check_signal(&signal) {
            Verdict::Approved(order) => {
                info!(
                    pair = %order.pair,
                    side = %order.side,
                    qty = %order.quantity,
                    reference = %order.reference_price,
                    strategy = %signal.strategy(),
                    "signal approved"
                );
                // Counted before submission; the executor decrements on
                // fill or failure.
                self.accounting.increment_open_orders();
                if self.order_tx.send(order).await.is_err() {
                    warn!("order channel closed, dropping approved order");
                    self.accounting.decrement_open_orders();
                }
            }
            Verdict::Rejected(reason, detail) => self.reject(&signal, reason, detail),
            Verdict::Dropped => {
                debug!(pair = %signal.pair(), "signal dropped, engine not running");
            }
        }
    }

    /// The rule chain, in order; the first failure wins.
    fn check_signal(&self, signal: &Signal) -> Verdict {
        // 1. Engine state gate
        if self.substate == Substate::Halted {
            return Verdict::Rejected(
                RejectionReason::DrawdownHalted,
                "new exposure blocked until drawdown reset".into(),
            );
        }
        if *self.state_rx.borrow() != EngineState::Running {
            return Verdict::Dropped;
        }

        // 2. Hard ceiling
        let open_orders = self.accounting.open_order_count();
        if open_orders >= MAX_OPEN_ORDERS {
            return Verdict::Rejected(
                RejectionReason::HardCeilingReached,
                format!("{open_orders} orders already in flight"),
            );
        }

        // 3. Quantity validity
        let quantity = signal.quantity();
        if quantity <= Decimal::ZERO {
            return Verdict::Rejected(
                RejectionReason::InvalidQuantity,
                format!("quantity {quantity} must be positive"),
            );
        }

        // 4. Exposure against the latest quote
        let Some(quote) = self.price_book.quote(signal.pair()) else {
            return Verdict::Rejected(
                RejectionReason::UnknownPair,
                format!("no quote seen for '{}'", signal.pair()),
            );
        };
        let reference_price = match signal.side() {
            OrderSide::Buy => quote.ask,
            OrderSide::Sell => quote.bid,
        };
        let notional = quantity * reference_price;
        let limit = self
            .config
            .max_exposure_per_trade
            .resolve(self.accounting.current_value());
        if notional > limit {
            return Verdict::Rejected(
                RejectionReason::ExposureLimitExceeded,
                format!("notional {notional} over limit {limit}"),
            );
        }

        // 5. Stop-loss proximity: with the current spread, the entry would
        // land inside the stop band and close immediately.
        if signal.side() == OrderSide::Buy {
            let stop_level = reference_price * (Decimal::ONE - self.config.stop_loss_pct);
            if stop_level >= reference_price - quote.spread() {
                return Verdict::Rejected(
                    RejectionReason::StopLossProximity,
                    format!(
                        "spread {} swallows the {} stop distance",
                        quote.spread(),
                        self.config.stop_loss_pct
                    ),
                );
            }
        }

        Verdict::Approved(Order::market(
            signal.pair(),
            signal.side(),
            quantity,
            reference_price,
            Some(OrderOrigin::Strategy),
        ))
    }

    fn reject(&self, signal: &Signal, reason: RejectionReason, detail: String) {
        warn!(
            pair = %signal.pair(),
            strategy = %signal.strategy(),
            reason = %reason,
            detail = %detail,
            "signal rejected"
        );
        let _ = self.event_tx.send(EngineEvent::Rejection {
            strategy: signal.strategy().to_string(),
            pair: signal.pair().to_string(),
            reason,
            detail,
        });
    }

    // ── Price monitor ───────────────────────────────────────────────────

    async fn handle_market_event(&mut self, event: &MarketEvent) {
        self.sweep_pending_closes();
        self.revalue_portfolio(event);
        self.monitor_positions(event).await;
    }

    fn revalue_portfolio(&mut self, event: &MarketEvent) {
        let unrealized = self
            .ledger
            .unrealized_pnl(|pair| self.price_book.quote(pair).map(|q| (q.bid, q.ask)));
        let value = self.accounting.realized_value() + unrealized;

        self.accounting.set_current_value(value);
        if *self.state_rx.borrow() == EngineState::Running {
            self.accounting.raise_peak(value);
        }

        let drawdown = self.accounting.drawdown();
        if self.substate == Substate::Normal && drawdown >= self.config.max_drawdown_pct {
            self.substate = Substate::Halted;
            warn!(
                drawdown = %drawdown,
                limit = %self.config.max_drawdown_pct,
                "maximum drawdown breached, halting new exposure"
            );
            let _ = self.event_tx.send(EngineEvent::Trigger {
                kind: TriggerKind::DrawdownHalt,
                pair: event.pair.clone(),
                detail: format!(
                    "drawdown {drawdown} breached limit {}",
                    self.config.max_drawdown_pct
                ),
            });
        }
    }

    async fn monitor_positions(&mut self, event: &MarketEvent) {
        let state = *self.state_rx.borrow();
        // Protective closes ride through a drawdown halt; they stop only
        // when the engine itself is not trading.
        if state != EngineState::Running && state != EngineState::Halted {
            return;
        }

        let candidates: Vec<Position> = self
            .ledger
            .open_positions()
            .into_iter()
            .filter(|p| p.pair == event.pair && !self.pending_closes.contains(&p.id))
            .collect();

        for position in candidates {
            if position.entry_price <= Decimal::ZERO {
                continue;
            }

            // Longs exit into the bid, shorts into the ask.
            let exit_price = match position.side {
                OrderSide::Buy => event.bid,
                OrderSide::Sell => event.ask,
            };
            let move_pct = match position.side {
                OrderSide::Buy => (exit_price - position.entry_price) / position.entry_price,
                OrderSide::Sell => (position.entry_price - exit_price) / position.entry_price,
            };

            if -move_pct >= self.config.stop_loss_pct {
                self.emit_protective_close(&position, TriggerKind::StopLossTriggered, exit_price)
                    .await;
            } else if move_pct >= self.config.take_profit_pct {
                self.emit_protective_close(&position, TriggerKind::TakeProfitTriggered, exit_price)
                    .await;
            }
        }
    }

    async fn emit_protective_close(
        &mut self,
        position: &Position,
        kind: TriggerKind,
        exit_price: Decimal,
    ) {
        // The ceiling is never bypassed, not even for closes; the trigger
        // re-fires on the next event once capacity frees up.
        let open_orders = self.accounting.open_order_count();
        if open_orders >= MAX_OPEN_ORDERS {
            warn!(
                pair = %position.pair,
                kind = %kind,
                "protective close held back by the order ceiling"
            );
            let _ = self.event_tx.send(EngineEvent::Rejection {
                strategy: "price-monitor".to_string(),
                pair: position.pair.clone(),
                reason: RejectionReason::HardCeilingReached,
                detail: format!("{kind} close deferred, {open_orders} orders in flight"),
            });
            return;
        }

        let origin = match kind {
            TriggerKind::StopLossTriggered => OrderOrigin::StopLoss,
            TriggerKind::TakeProfitTriggered => OrderOrigin::TakeProfit,
            TriggerKind::DrawdownHalt => OrderOrigin::DrawdownLiquidation,
        };
        let order = Order::market(
            position.pair.clone(),
            position.side.closing_side(),
            position.quantity,
            exit_price,
            Some(origin),
        );

        info!(
            pair = %position.pair,
            kind = %kind,
            qty = %position.quantity,
            exit = %exit_price,
            "protective close emitted"
        );
        self.accounting.increment_open_orders();
        self.pending_closes.insert(position.id.clone());
        if self.order_tx.send(order).await.is_err() {
            warn!("order channel closed, dropping protective close");
            self.accounting.decrement_open_orders();
            self.pending_closes.remove(&position.id);
            return;
        }

        let _ = self.event_tx.send(EngineEvent::Trigger {
            kind,
            pair: position.pair.clone(),
            detail: format!("closing {} at {exit_price}", position.quantity),
        });
    }

    // ── Controls ────────────────────────────────────────────────────────

    async fn handle_control(&mut self, control: RiskControl) {
        match control {
            RiskControl::ResetDrawdown => {
                let current = self.accounting.current_value();
                self.accounting.reseed_peak(current);
                if self.substate == Substate::Halted {
                    self.substate = Substate::Normal;
                    info!(peak = %current, "drawdown halt cleared, peak reseeded");
                } else {
                    info!(peak = %current, "drawdown peak reseeded");
                }
            }
            RiskControl::FlattenAll => {
                let positions = self.ledger.open_positions();
                info!(count = positions.len(), "flattening all open positions");

                for position in positions {
                    if self.pending_closes.contains(&position.id) {
                        continue;
                    }
                    let reference = self
                        .price_book
                        .quote(&position.pair)
                        .map(|q| match position.side {
                            OrderSide::Buy => q.bid,
                            OrderSide::Sell => q.ask,
                        })
                        .unwrap_or(position.entry_price);

                    let order = Order::market(
                        position.pair.clone(),
                        position.side.closing_side(),
                        position.quantity,
                        reference,
                        None,
                    );
                    self.accounting.increment_open_orders();
                    self.pending_closes.insert(position.id.clone());
                    if self.order_tx.send(order).await.is_err() {
                        warn!("order channel closed during flatten");
                        self.accounting.decrement_open_orders();
                        return;
                    }
                }
            }
        }
    }

    // ── Pending-close bookkeeping ───────────────────────────────────────

    fn sweep_pending_closes(&mut self) {
        if self.pending_closes.is_empty() {
            return;
        }
        let open: HashSet<String> = self
            .ledger
            .open_positions()
            .into_iter()
            .map(|p| p.id)
            .collect();
        self.pending_closes.retain(|id| open.contains(id));
    }

    fn clear_pending_for_pair(&mut self, pair: &str) {
        let ids: Vec<String> = self
            .ledger
            .open_positions()
            .into_iter()
            .filter(|p| p.pair == pair)
            .map(|p| p.id)
            .collect();
        for id in ids {
            self.pending_closes.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::create_accounting;
    use crate::config::ExposureLimit;
    use chrono::Utc;
    use exchange_core::create_price_book;
    use model::{Fill, TradingMode};
    use rust_decimal_macros::dec;

    struct Harness {
        manager: RiskManager,
        order_rx: mpsc::Receiver<Order>,
        event_rx: broadcast::Receiver<EngineEvent>,
        state_tx: watch::Sender<EngineState>,
        accounting: SharedAccounting,
        ledger: Arc<PositionLedger>,
        price_book: SharedPriceBook,
    }

    async fn harness(config: RiskConfig) -> Harness {
        let ledger = Arc::new(
            PositionLedger::open("sqlite::memory:", TradingMode::Paper)
                .await
                .unwrap(),
        );
        let price_book = create_price_book();
        let accounting = create_accounting(dec!(10000));

        let (state_tx, state_rx) = watch::channel(EngineState::Running);
        let (_signal_tx, signal_rx) = mpsc::channel(16);
        let (_control_tx, control_rx) = mpsc::channel(16);
        let (market_tx, market_rx) = broadcast::channel(64);
        let (event_tx, event_rx) = broadcast::channel(64);
        let (order_tx, order_rx) = mpsc::channel(16);
        drop(market_tx);

        let manager = RiskManager::new(
            config,
            ledger.clone(),
            price_book.clone(),
            accounting.clone(),
            state_rx,
            signal_rx,
            control_rx,
            market_rx,
            event_rx.resubscribe(),
            order_tx,
            event_tx,
        );

        Harness {
            manager,
            order_rx,
            event_rx,
            state_tx,
            accounting,
            ledger,
            price_book,
        }
    }

    fn scenario_config() -> RiskConfig {
        RiskConfig {
            stop_loss_pct: dec!(0.05),
            take_profit_pct: dec!(0.10),
            max_exposure_per_trade: ExposureLimit::AbsoluteUsd(dec!(1000)),
            max_drawdown_pct: dec!(0.20),
        }
    }

    fn market_event(pair: &str, bid: Decimal, ask: Decimal) -> MarketEvent {
        MarketEvent {
            pair: pair.into(),
            timestamp: Utc::now(),
            bid,
            ask,
            last: bid,
            volume: None,
        }
    }

    fn quote(h: &Harness, pair: &str, bid: Decimal, ask: Decimal) {
        h.price_book.update(&market_event(pair, bid, ask));
    }

    fn buy(pair: &str, quantity: Decimal) -> Signal {
        Signal::Buy {
            pair: pair.into(),
            quantity,
            strategy: "test".into(),
        }
    }

    async fn open_long(h: &Harness, pair: &str, entry: Decimal, quantity: Decimal) {
        h.ledger
            .upsert_on_buy(&Fill {
                order_id: uuid::Uuid::new_v4().to_string(),
                pair: pair.into(),
                side: OrderSide::Buy,
                executed_price: entry,
                executed_quantity: quantity,
                executed_at: Utc::now(),
                exchange_id: None,
            })
            .await
            .unwrap();
    }

    fn expect_rejection(h: &mut Harness, expected: RejectionReason) {
        loop {
            match h.event_rx.try_recv() {
                Ok(EngineEvent::Rejection { reason, .. }) => {
                    assert_eq!(reason, expected);
                    return;
                }
                Ok(_) => continue,
                Err(e) => panic!("expected rejection {expected:?}, got {e:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_valid_buy_becomes_market_order() {
        let mut h = harness(scenario_config()).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));

        h.manager.handle_signal(buy("BTCUSDT", dec!(0.04))).await;

        let order = h.order_rx.try_recv().expect("an approved order");
        assert_eq!(order.reference_price, dec!(20000));
        assert_eq!(order.origin, Some(OrderOrigin::Strategy));
        assert_eq!(h.accounting.open_order_count(), 1);
    }

    #[tokio::test]
    async fn test_excess_notional_is_rejected() {
        let mut h = harness(scenario_config()).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));

        // 0.06 × 20000 = 1200 > 1000
        h.manager.handle_signal(buy("BTCUSDT", dec!(0.06))).await;

        assert!(h.order_rx.try_recv().is_err(), "no order may be emitted");
        assert_eq!(h.accounting.open_order_count(), 0);
        expect_rejection(&mut h, RejectionReason::ExposureLimitExceeded);
    }

    #[tokio::test]
    async fn test_unknown_pair_is_rejected() {
        let mut h = harness(scenario_config()).await;
        h.manager.handle_signal(buy("DOGEUSDT", dec!(1))).await;
        expect_rejection(&mut h, RejectionReason::UnknownPair);
    }

    #[tokio::test]
    async fn test_non_positive_quantity_is_rejected() {
        let mut h = harness(scenario_config()).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));
        h.manager.handle_signal(buy("BTCUSDT", dec!(0))).await;
        expect_rejection(&mut h, RejectionReason::InvalidQuantity);
    }

    #[tokio::test]
    async fn test_wide_spread_blocks_buys_near_stop() {
        let mut h = harness(RiskConfig {
            stop_loss_pct: dec!(0.04),
            ..scenario_config()
        })
        .await;
        // Spread 1000 swallows the 4% stop distance (800) on a 20000 ask
        quote(&h, "BTCUSDT", dec!(19000), dec!(20000));

        h.manager.handle_signal(buy("BTCUSDT", dec!(0.01))).await;
        expect_rejection(&mut h, RejectionReason::StopLossProximity);
    }

    #[tokio::test]
    async fn test_signals_dropped_silently_while_paused() {
        let mut h = harness(scenario_config()).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));
        h.state_tx.send(EngineState::Paused).unwrap();

        h.manager.handle_signal(buy("BTCUSDT", dec!(0.04))).await;

        assert!(h.order_rx.try_recv().is_err());
        assert!(matches!(
            h.event_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_ceiling_rejects_when_full() {
        let mut h = harness(scenario_config()).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));
        for _ in 0..MAX_OPEN_ORDERS {
            h.accounting.increment_open_orders();
        }

        h.manager.handle_signal(buy("BTCUSDT", dec!(0.01))).await;

        assert!(h.order_rx.try_recv().is_err());
        expect_rejection(&mut h, RejectionReason::HardCeilingReached);
    }

    #[tokio::test]
    async fn test_stop_loss_emits_close_and_trigger() {
        let mut h = harness(scenario_config()).await;
        open_long(&h, "BTCUSDT", dec!(20000), dec!(0.04)).await;
        quote(&h, "BTCUSDT", dec!(19200), dec!(19210));

        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(19200), dec!(19210)))
            .await;

        let order = h.order_rx.try_recv().expect("a close order");
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, dec!(0.04));
        assert_eq!(order.origin, Some(OrderOrigin::StopLoss));

        let trigger = loop {
            match h.event_rx.try_recv().unwrap() {
                EngineEvent::Trigger { kind, .. } => break kind,
                _ => continue,
            }
        };
        assert_eq!(trigger, TriggerKind::StopLossTriggered);
    }

    #[tokio::test]
    async fn test_take_profit_emits_close_and_trigger() {
        let mut h = harness(scenario_config()).await;
        open_long(&h, "BTCUSDT", dec!(20000), dec!(0.04)).await;
        quote(&h, "BTCUSDT", dec!(22100), dec!(22110));

        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(22100), dec!(22110)))
            .await;

        let order = h.order_rx.try_recv().expect("a close order");
        assert_eq!(order.origin, Some(OrderOrigin::TakeProfit));
    }

    #[tokio::test]
    async fn test_short_position_closes_on_rising_ask() {
        let mut h = harness(scenario_config()).await;
        // Opening sell = short at 20000
        h.ledger
            .upsert_on_buy(&Fill {
                order_id: uuid::Uuid::new_v4().to_string(),
                pair: "BTCUSDT".into(),
                side: OrderSide::Sell,
                executed_price: dec!(20000),
                executed_quantity: dec!(0.04),
                executed_at: Utc::now(),
                exchange_id: None,
            })
            .await
            .unwrap();
        quote(&h, "BTCUSDT", dec!(21190), dec!(21200));

        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(21190), dec!(21200)))
            .await;

        let order = h.order_rx.try_recv().expect("buy-to-close");
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.origin, Some(OrderOrigin::StopLoss));
    }

    #[tokio::test]
    async fn test_position_triggers_once_while_close_in_flight() {
        let mut h = harness(scenario_config()).await;
        open_long(&h, "BTCUSDT", dec!(20000), dec!(0.04)).await;

        let crash = market_event("BTCUSDT", dec!(19000), dec!(19010));
        h.price_book.update(&crash);
        h.manager.handle_market_event(&crash).await;
        h.manager.handle_market_event(&crash).await;

        assert!(h.order_rx.try_recv().is_ok());
        assert!(
            h.order_rx.try_recv().is_err(),
            "second event must not re-trigger the same position"
        );
    }

    #[tokio::test]
    async fn test_drawdown_halts_then_reset_reopens() {
        let mut h = harness(scenario_config()).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));

        // Portfolio falls from the 10000 peak to 7999
        h.accounting.apply_realized(dec!(-2001));
        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(19990), dec!(20000)))
            .await;

        let halted = loop {
            match h.event_rx.try_recv().unwrap() {
                EngineEvent::Trigger {
                    kind: TriggerKind::DrawdownHalt,
                    ..
                } => break true,
                _ => continue,
            }
        };
        assert!(halted);

        // New exposure is refused while halted
        h.manager.handle_signal(buy("BTCUSDT", dec!(0.01))).await;
        expect_rejection(&mut h, RejectionReason::DrawdownHalted);

        // Reset reseeds the peak and reopens the signal path
        h.manager.handle_control(RiskControl::ResetDrawdown).await;
        assert_eq!(h.accounting.drawdown(), dec!(0));

        h.manager.handle_signal(buy("BTCUSDT", dec!(0.01))).await;
        assert!(h.order_rx.try_recv().is_ok(), "signal path must reopen");
    }

    #[tokio::test]
    async fn test_protective_close_allowed_while_halted() {
        let mut h = harness(scenario_config()).await;
        open_long(&h, "BTCUSDT", dec!(20000), dec!(0.04)).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));

        // Trip the breaker
        h.accounting.apply_realized(dec!(-2001));
        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(19990), dec!(20000)))
            .await;
        // Engine state follows the halt
        h.state_tx.send(EngineState::Halted).unwrap();
        while h.order_rx.try_recv().is_ok() {}

        // Stop-loss breach: the close still goes out
        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(18900), dec!(18910)))
            .await;

        let order = h.order_rx.try_recv().expect("close despite halt");
        assert_eq!(order.origin, Some(OrderOrigin::StopLoss));
    }

    #[tokio::test]
    async fn test_protective_close_still_respects_ceiling() {
        let mut h = harness(scenario_config()).await;
        open_long(&h, "BTCUSDT", dec!(20000), dec!(0.04)).await;
        for _ in 0..MAX_OPEN_ORDERS {
            h.accounting.increment_open_orders();
        }

        h.manager
            .handle_market_event(&market_event("BTCUSDT", dec!(18900), dec!(18910)))
            .await;

        assert!(h.order_rx.try_recv().is_err());
        expect_rejection(&mut h, RejectionReason::HardCeilingReached);
    }

    #[tokio::test]
    async fn test_flatten_emits_closing_orders_for_every_position() {
        let mut h = harness(scenario_config()).await;
        open_long(&h, "BTCUSDT", dec!(20000), dec!(0.04)).await;
        open_long(&h, "ETHUSDT", dec!(1500), dec!(1)).await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));
        quote(&h, "ETHUSDT", dec!(1499), dec!(1500));

        h.manager.handle_control(RiskControl::FlattenAll).await;

        let mut pairs = Vec::new();
        while let Ok(order) = h.order_rx.try_recv() {
            assert_eq!(order.side, OrderSide::Sell);
            assert_eq!(order.origin, None);
            pairs.push(order.pair);
        }
        pairs.sort();
        assert_eq!(pairs, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn test_percentage_exposure_tracks_portfolio_value() {
        let mut h = harness(RiskConfig {
            max_exposure_per_trade: ExposureLimit::PortfolioFraction(dec!(0.05)),
            ..scenario_config()
        })
        .await;
        quote(&h, "BTCUSDT", dec!(19990), dec!(20000));

        // 5% of 10000 = 500; 0.04 × 20000 = 800
        h.manager.handle_signal(buy("BTCUSDT", dec!(0.04))).await;
        expect_rejection(&mut h, RejectionReason::ExposureLimitExceeded);

        // 0.02 × 20000 = 400 passes
        h.manager.handle_signal(buy("BTCUSDT", dec!(0.02))).await;
        assert!(h.order_rx.try_recv().is_ok());
    }
}
