//! The exchange capability boundary.
//!
//! `ExchangeClient` is the only way orders leave the process. The concrete
//! instance is injected into the order executor alone; every other
//! component sees market data through the stream and the shared
//! [`PriceBook`]. That visibility rule is what makes the risk gateway
//! non-bypassable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::oneshot;

use model::{Fill, MarketEvent, Order, Position};

/// Submission failure taxonomy. Nothing in the kernel retries
/// automatically; retry policy belongs to the operator.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("order rejected by exchange: {reason}")]
    Rejected { reason: String },

    #[error("transport failure (retryable: {retryable}): {detail}")]
    Transport { retryable: bool, detail: String },

    #[error("insufficient funds")]
    InsufficientFunds,
}

/// Capability interface over an exchange: order submission plus the
/// position inspection used for startup/reconnect reconciliation.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn submit_order(&self, order: &Order) -> Result<Fill, ExchangeError>;

    async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError>;
}

/// Latest top-of-book and last-trade data for one pair.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Shared cache of the most recent quote per pair.
///
/// The ingestor writes it on every decoded event; the risk manager reads
/// reference prices from it and the paper client fills against it. Locks
/// are never held across an await point.
pub struct PriceBook {
    quotes: RwLock<HashMap<String, Quote>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, event: &MarketEvent) {
        let quote = Quote {
            bid: event.bid,
            ask: event.ask,
            last: event.last,
            volume: event.volume,
            timestamp: event.timestamp,
        };
        self.quotes.write().insert(event.pair.clone(), quote);
    }

    pub fn quote(&self, pair: &str) -> Option<Quote> {
        self.quotes.read().get(pair).copied()
    }

    pub fn bid(&self, pair: &str) -> Option<Decimal> {
        self.quote(pair).map(|q| q.bid)
    }

    pub fn ask(&self, pair: &str) -> Option<Decimal> {
        self.quote(pair).map(|q| q.ask)
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedPriceBook = Arc<PriceBook>;

pub fn create_price_book() -> SharedPriceBook {
    Arc::new(PriceBook::new())
}

/// Handshake sent by the ingestor on every (re)connect. Event emission
/// resumes only after the receiver acks, so the position audit always runs
/// against a quiet ledger.
#[derive(Debug)]
pub struct AuditRequest {
    pub ack: oneshot::Sender<()>,
}
