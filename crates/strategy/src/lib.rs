//! Strategy engine: pluggable strategies fed per-pair market event slices.
//!
//! Strategies are pure with respect to their own interior state: no I/O,
//! no side effects beyond a bounded rolling buffer. Whatever they propose
//! goes into one signal channel and faces the risk manager.

mod config;
mod engine;
pub mod indicators;

pub use config::{StrategyConfig, StrategyFileConfig};
pub use engine::StrategyEngine;

use thiserror::Error;

use model::{MarketEvent, Signal};

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("failed to read strategy config '{path}': {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse strategy config '{path}': {source}")]
    ConfigParse {
        path: String,
        source: toml::de::Error,
    },

    #[error("unknown strategy type '{0}'")]
    UnknownStrategyType(String),
}

/// A pluggable trading strategy.
pub trait Strategy: Send {
    /// Instance name, carried on every signal for the audit trail.
    fn name(&self) -> &str;

    /// The single pair this instance watches.
    fn pair(&self) -> &str;

    /// Evaluate the latest events for this strategy's pair.
    ///
    /// May keep bounded rolling state across calls; must not perform I/O.
    fn evaluate(&mut self, events: &[MarketEvent]) -> Option<Signal>;
}
