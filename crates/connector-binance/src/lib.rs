//! Binance WebSocket market ingestor.
//!
//! Owns the stream lifecycle for the configured pair group, decodes frames
//! into typed [`model::MarketEvent`]s, and fans them out on the broadcast
//! bus. Reconnects with full-jitter exponential backoff and requests a
//! position audit before emission resumes after every (re)connect.

mod parser;
mod stream;

pub use parser::{parse_frame, ParsedFrame};
pub use stream::MarketStream;
