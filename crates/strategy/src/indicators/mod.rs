//! Technical indicators used as components inside strategies.
//!
//! Both indicators are incremental and edge-triggered: they report
//! threshold *crossings*, not levels, so a noisy series hovering around a
//! threshold cannot flap signals.

mod macd;
mod rsi;

pub use macd::{Macd, MacdCross};
pub use rsi::Rsi;
