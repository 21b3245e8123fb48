//! Signed Binance REST client: the live half of the exchange capability.

mod client;

pub use client::BinanceRestClient;
