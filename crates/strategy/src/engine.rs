use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use model::{EngineEvent, EngineState, MarketEvent, Signal};

use crate::config::{StrategyConfig, StrategyFileConfig};
use crate::indicators::{Macd, MacdCross, Rsi};
use crate::{Strategy, StrategyError};

/// Hosts the configured strategy instances and routes per-pair events.
pub struct StrategyEngine {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyEngine {
    /// Build the registry; an unknown strategy type is a startup error.
    pub fn from_config(config: &StrategyFileConfig) -> Result<Self, StrategyError> {
        let mut strategies = Vec::with_capacity(config.strategies.len());
        for entry in &config.strategies {
            let strategy = build_strategy(entry)?;
            info!(name = %strategy.name(), pair = %strategy.pair(), kind = %entry.kind, "registered strategy");
            strategies.push(strategy);
        }
        Ok(Self { strategies })
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Deliver one event to every strategy configured for its pair and
    /// collect whatever they propose. Strategies watching other pairs never
    /// see the event.
    pub fn process(&mut self, event: &MarketEvent) -> Vec<Signal> {
        let slice = std::slice::from_ref(event);
        self.strategies
            .iter_mut()
            .filter(|s| s.pair() == event.pair)
            .filter_map(|s| s.evaluate(slice))
            .collect()
    }

    /// Dispatch loop: market events in, signals out.
    ///
    /// Signals are only produced while the engine is `Running`; a lagging
    /// bus subscription drops oldest events and reports itself. A config
    /// sent over `reload_rx` swaps the registry between events.
    pub async fn run(
        mut self,
        mut market_rx: broadcast::Receiver<MarketEvent>,
        signal_tx: mpsc::Sender<Signal>,
        state_rx: watch::Receiver<EngineState>,
        event_tx: broadcast::Sender<EngineEvent>,
        mut reload_rx: mpsc::Receiver<StrategyFileConfig>,
    ) {
        info!(strategies = self.strategies.len(), "strategy engine running");

        loop {
            tokio::select! {
                Some(config) = reload_rx.recv() => {
                    match Self::from_config(&config) {
                        Ok(next) => {
                            info!(strategies = next.strategies.len(), "strategy registry reloaded");
                            self.strategies = next.strategies;
                        }
                        Err(e) => error!(error = %e, "strategy reload rejected, keeping current registry"),
                    }
                }

                event = market_rx.recv() => match event {
                    Ok(event) => {
                        if *state_rx.borrow() != EngineState::Running {
                            continue;
                        }
                        for signal in self.process(&event) {
                            if signal_tx.send(signal).await.is_err() {
                                warn!("signal channel closed, strategy engine exiting");
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "strategy engine lagged behind the market bus");
                        let _ = event_tx.send(EngineEvent::LaggedConsumer {
                            subscriber: "strategy-engine",
                            dropped,
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("market bus closed, strategy engine exiting");
                        return;
                    }
                },
            }
        }
    }
}

fn build_strategy(config: &StrategyConfig) -> Result<Box<dyn Strategy>, StrategyError> {
    match config.kind.as_str() {
        "rsi" => Ok(Box::new(RsiStrategy::new(config))),
        "macd" => Ok(Box::new(MacdStrategy::new(config))),
        other => Err(StrategyError::UnknownStrategyType(other.to_string())),
    }
}

/// Buys oversold crossings, sells overbought crossings.
struct RsiStrategy {
    name: String,
    pair: String,
    quantity: Decimal,
    rsi: Rsi,
    overbought: f64,
    oversold: f64,
    prev_value: Option<f64>,
}

impl RsiStrategy {
    fn new(config: &StrategyConfig) -> Self {
        Self {
            name: config.name.clone(),
            pair: config.pair.clone(),
            quantity: config.quantity,
            rsi: Rsi::new(config.param_usize("period", 14)),
            overbought: config.param_f64("overbought", 70.0),
            oversold: config.param_f64("oversold", 30.0),
            prev_value: None,
        }
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        &self.pair
    }

    fn evaluate(&mut self, events: &[MarketEvent]) -> Option<Signal> {
        let mut proposal = None;

        for event in events.iter().filter(|e| e.pair == self.pair) {
            let Some(price) = event.last.to_f64() else {
                continue;
            };
            let Some(value) = self.rsi.update(price) else {
                continue;
            };
            let Some(prev) = self.prev_value.replace(value) else {
                continue;
            };

            if prev >= self.oversold && value < self.oversold {
                proposal = Some(Signal::Buy {
                    pair: self.pair.clone(),
                    quantity: self.quantity,
                    strategy: self.name.clone(),
                });
            } else if prev <= self.overbought && value > self.overbought {
                proposal = Some(Signal::Sell {
                    pair: self.pair.clone(),
                    quantity: self.quantity,
                    strategy: self.name.clone(),
                });
            }
        }

        proposal
    }
}

/// Buys bullish MACD crossings, sells bearish ones.
struct MacdStrategy {
    name: String,
    pair: String,
    quantity: Decimal,
    macd: Macd,
}

impl MacdStrategy {
    fn new(config: &StrategyConfig) -> Self {
        Self {
            name: config.name.clone(),
            pair: config.pair.clone(),
            quantity: config.quantity,
            macd: Macd::new(
                config.param_usize("fast", 12),
                config.param_usize("slow", 26),
                config.param_usize("signal", 9),
            ),
        }
    }
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        &self.pair
    }

    fn evaluate(&mut self, events: &[MarketEvent]) -> Option<Signal> {
        let mut proposal = None;

        for event in events.iter().filter(|e| e.pair == self.pair) {
            let Some(price) = event.last.to_f64() else {
                continue;
            };
            match self.macd.update(price) {
                Some(MacdCross::Bullish) => {
                    proposal = Some(Signal::Buy {
                        pair: self.pair.clone(),
                        quantity: self.quantity,
                        strategy: self.name.clone(),
                    });
                }
                Some(MacdCross::Bearish) => {
                    proposal = Some(Signal::Sell {
                        pair: self.pair.clone(),
                        quantity: self.quantity,
                        strategy: self.name.clone(),
                    });
                }
                _ => {}
            }
        }

        proposal
    }
}
