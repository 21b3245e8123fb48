//! Core domain types shared across the trading kernel.
//!
//! Everything that crosses a channel boundary lives here: market events,
//! strategy signals, risk-approved orders, fills, positions, closed trades,
//! and the engine lifecycle/event vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position held on this side.
    pub fn closing_side(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("invalid order side '{other}'")),
        }
    }
}

/// Whether the process trades against the real exchange or a simulation.
///
/// Fixed for the process lifetime; persisted rows carry it so live and
/// paper records coexist in one store without cross-contamination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
        }
    }
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "paper" => Ok(Self::Paper),
            other => Err(format!(
                "invalid trading mode '{other}', expected 'live' or 'paper'"
            )),
        }
    }
}

/// A snapshot of a single pair at a single instant, as decoded from the
/// exchange stream. Immutable; consumed via the broadcast bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub pair: String,
    /// Source-stamped event time.
    pub timestamp: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Last traded price.
    pub last: Decimal,
    pub volume: Option<Decimal>,
}

impl MarketEvent {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// A strategy's proposal to buy or sell. Not an order: every signal must
/// pass the risk manager before anything reaches the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Signal {
    Buy {
        pair: String,
        quantity: Decimal,
        /// Originating strategy name, kept for the audit trail.
        strategy: String,
    },
    Sell {
        pair: String,
        quantity: Decimal,
        strategy: String,
    },
}

impl Signal {
    pub fn pair(&self) -> &str {
        match self {
            Self::Buy { pair, .. } | Self::Sell { pair, .. } => pair,
        }
    }

    pub fn quantity(&self) -> Decimal {
        match self {
            Self::Buy { quantity, .. } | Self::Sell { quantity, .. } => *quantity,
        }
    }

    pub fn side(&self) -> OrderSide {
        match self {
            Self::Buy { .. } => OrderSide::Buy,
            Self::Sell { .. } => OrderSide::Sell,
        }
    }

    pub fn strategy(&self) -> &str {
        match self {
            Self::Buy { strategy, .. } | Self::Sell { strategy, .. } => strategy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    /// Limit at the order's reference price.
    Limit,
}

/// Why an order exists. `None` marks supervisor-driven shutdown flattening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOrigin {
    Strategy,
    StopLoss,
    TakeProfit,
    DrawdownLiquidation,
}

impl fmt::Display for OrderOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strategy => write!(f, "strategy"),
            Self::StopLoss => write!(f, "stop-loss"),
            Self::TakeProfit => write!(f, "take-profit"),
            Self::DrawdownLiquidation => write!(f, "drawdown-liquidation"),
        }
    }
}

/// A risk-approved intent to submit to the exchange.
///
/// Constructed by the risk manager only; the executor is the sole consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Latest ask (buys) or bid (sells) at approval time.
    pub reference_price: Decimal,
    pub kind: OrderKind,
    pub origin: Option<OrderOrigin>,
}

impl Order {
    pub fn market(
        pair: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        reference_price: Decimal,
        origin: Option<OrderOrigin>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.into(),
            side,
            quantity,
            reference_price,
            kind: OrderKind::Market,
            origin,
        }
    }

    /// Dollar value of the order at its reference price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.reference_price
    }
}

/// The exchange's confirmation of an executed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub executed_price: Decimal,
    pub executed_quantity: Decimal,
    pub executed_at: DateTime<Utc>,
    /// Exchange-assigned identifier, when the venue provides one.
    pub exchange_id: Option<String>,
}

/// An open exposure: one pair, one side, held until closed.
///
/// Invariants: at most one position per `(pair, side)` per mode;
/// `quantity > 0`; `entry_price > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub mode: TradingMode,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Mark-to-market PnL: longs exit into the bid, shorts into the ask.
    pub fn unrealized_pnl(&self, bid: Decimal, ask: Decimal) -> Decimal {
        match self.side {
            OrderSide::Buy => (bid - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - ask) * self.quantity,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }
}

/// A closed position with realized PnL. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl_usd: Decimal,
    pub mode: TradingMode,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl Trade {
    /// `(exit − entry) × quantity`, negated for shorts.
    pub fn realized_pnl(
        side: OrderSide,
        entry_price: Decimal,
        exit_price: Decimal,
        quantity: Decimal,
    ) -> Decimal {
        match side {
            OrderSide::Buy => (exit_price - entry_price) * quantity,
            OrderSide::Sell => (entry_price - exit_price) * quantity,
        }
    }
}

/// Engine lifecycle state. Only the supervisor mutates it; every other
/// subsystem observes transitions on a watch channel and gates its own work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    Paused,
    /// Transient drain phase between a `Stop` command and `Stopped`.
    Stopping,
    Halted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

/// Operator commands accepted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start,
    Stop,
    Pause,
    Resume,
    ResetDrawdown,
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::ResetDrawdown => write!(f, "reset-drawdown"),
        }
    }
}

/// Acknowledgement returned for every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    Denied(String),
}

/// Why the risk manager refused a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    ExposureLimitExceeded,
    StopLossProximity,
    HardCeilingReached,
    DrawdownHalted,
    UnknownPair,
    InvalidQuantity,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExposureLimitExceeded => write!(f, "exposure limit exceeded"),
            Self::StopLossProximity => write!(f, "entry within stop-loss band"),
            Self::HardCeilingReached => write!(f, "open-order ceiling reached"),
            Self::DrawdownHalted => write!(f, "drawdown halt active"),
            Self::UnknownPair => write!(f, "no market data for pair"),
            Self::InvalidQuantity => write!(f, "invalid quantity"),
        }
    }
}

/// Protective actions announced by the risk manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLossTriggered,
    TakeProfitTriggered,
    DrawdownHalt,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopLossTriggered => write!(f, "stop-loss triggered"),
            Self::TakeProfitTriggered => write!(f, "take-profit triggered"),
            Self::DrawdownHalt => write!(f, "drawdown halt"),
        }
    }
}

/// Typed events published on the broadcast bus for external subscribers
/// (dashboard, chat-bot) and for the supervisor's own observation loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Rejection {
        strategy: String,
        pair: String,
        reason: RejectionReason,
        detail: String,
    },
    Trigger {
        kind: TriggerKind,
        pair: String,
        detail: String,
    },
    OrderFilled {
        fill: Fill,
        origin: Option<OrderOrigin>,
    },
    OrderFailed {
        pair: String,
        origin: Option<OrderOrigin>,
        reason: String,
    },
    StateChanged {
        from: EngineState,
        to: EngineState,
    },
    /// The store and the in-memory ledger no longer agree; fatal until an
    /// operator intervenes.
    PersistenceDivergence { detail: String },
    /// A position known to the exchange but not to the ledger was adopted
    /// during an audit.
    OrphanedPosition { position: Position },
    /// A slow bus subscriber dropped its oldest events.
    LaggedConsumer {
        subscriber: &'static str,
        dropped: u64,
    },
    /// Positions still open when the stop drain window expired.
    StopTimeoutOrphans { pairs: Vec<String> },
    /// The market stream did not come up within the start deadline.
    StreamUnavailable,
}
