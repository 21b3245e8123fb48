use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use common::{BinanceEnvironment, ExponentialBackoff};
use exchange_core::{AuditRequest, SharedPriceBook};
use model::MarketEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Binance closes sessions at a ~24 h cadence; rolling over proactively
/// keeps the disconnect on our schedule instead of mid-burst.
const SESSION_ROLLOVER: Duration = Duration::from_secs(24 * 60 * 60);

/// A session that survived this long resets the reconnect backoff.
const STABLE_SESSION_THRESHOLD: Duration = Duration::from_secs(300);

/// Bid/ask arrive on `@bookTicker`, last price and volume on `@aggTrade`;
/// an event is published once a pair has seen both sides.
#[derive(Default)]
struct QuoteAssembly {
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    last: Option<Decimal>,
    volume: Option<Decimal>,
    timestamp_ms: Option<i64>,
}

enum SessionEnd {
    Shutdown,
    Rollover,
    Closed { duration: Duration, detail: String },
    ConnectFailed(String),
}

/// Owns the persistent market stream for one pair group.
pub struct MarketStream {
    pairs: Vec<String>,
    environment: BinanceEnvironment,
    market_tx: broadcast::Sender<MarketEvent>,
    price_book: SharedPriceBook,
    audit_tx: mpsc::Sender<AuditRequest>,
    ready_tx: watch::Sender<bool>,
}

impl MarketStream {
    pub fn new(
        pairs: Vec<String>,
        environment: BinanceEnvironment,
        market_tx: broadcast::Sender<MarketEvent>,
        price_book: SharedPriceBook,
        audit_tx: mpsc::Sender<AuditRequest>,
        ready_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            pairs,
            environment,
            market_tx,
            price_book,
            audit_tx,
            ready_tx,
        }
    }

    /// Run the stream until shutdown, reconnecting on every failure with
    /// full-jitter backoff. Each (re)connect requests a position audit and
    /// waits for its ack before any event is published.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let url = stream_url(self.environment.ws_base_url(), &self.pairs);
        let mut backoff = ExponentialBackoff::default();
        let mut assembly: HashMap<String, QuoteAssembly> = HashMap::new();

        loop {
            if *shutdown_rx.borrow() {
                info!("shutdown requested, stopping market stream");
                return;
            }

            match self.run_session(&url, &mut assembly, &mut shutdown_rx).await {
                SessionEnd::Shutdown => {
                    info!("market stream shut down");
                    return;
                }
                SessionEnd::Rollover => {
                    info!("scheduled session rollover, reconnecting");
                    backoff.reset();
                }
                SessionEnd::Closed { duration, detail } => {
                    if duration >= STABLE_SESSION_THRESHOLD {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        detail = %detail,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "market stream lost, reconnecting"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        return;
                    }
                }
                SessionEnd::ConnectFailed(detail) => {
                    let delay = backoff.next_delay();
                    warn!(
                        detail = %detail,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "market stream connect failed, retrying"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        return;
                    }
                }
            }
        }
    }

    async fn run_session(
        &self,
        url: &str,
        assembly: &mut HashMap<String, QuoteAssembly>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        info!(url = %url, pairs = ?self.pairs, "connecting market stream");

        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url));
        let ws_stream = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
                return SessionEnd::ConnectFailed("interrupted".into());
            }
            result = connect => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => return SessionEnd::ConnectFailed(e.to_string()),
                Err(_) => return SessionEnd::ConnectFailed("connect timeout".into()),
            },
        };

        info!("market stream connected");
        let connected_at = std::time::Instant::now();
        self.ready_tx.send_replace(true);

        // Audit before emission: the ledger reconciles against the exchange
        // while no new events are flowing.
        self.request_audit().await;

        let rollover_at = tokio::time::Instant::now() + SESSION_ROLLOVER;
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = write.close().await;
                        return SessionEnd::Shutdown;
                    }
                }

                _ = tokio::time::sleep_until(rollover_at) => {
                    let _ = write.close().await;
                    return SessionEnd::Rollover;
                }

                message = read.next() => {
                    let message = match message {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            return SessionEnd::Closed {
                                duration: connected_at.elapsed(),
                                detail: e.to_string(),
                            };
                        }
                        None => {
                            return SessionEnd::Closed {
                                duration: connected_at.elapsed(),
                                detail: "stream ended".into(),
                            };
                        }
                    };

                    match message {
                        Message::Text(text) => self.handle_frame(&text, assembly),
                        Message::Ping(payload) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                return SessionEnd::Closed {
                                    duration: connected_at.elapsed(),
                                    detail: format!("pong failed: {e}"),
                                };
                            }
                        }
                        Message::Close(_) => {
                            return SessionEnd::Closed {
                                duration: connected_at.elapsed(),
                                detail: "closed by server".into(),
                            };
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, assembly: &mut HashMap<String, QuoteAssembly>) {
        let frame = match crate::parser::parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to decode market frame");
                return;
            }
        };

        let pair = match frame {
            crate::parser::ParsedFrame::BookTicker(update) => {
                let entry = assembly.entry(update.symbol.clone()).or_default();
                entry.bid = Some(update.bid);
                entry.ask = Some(update.ask);
                update.symbol
            }
            crate::parser::ParsedFrame::AggTrade(trade) => {
                let entry = assembly.entry(trade.symbol.clone()).or_default();
                entry.last = Some(trade.price);
                entry.volume = Some(trade.quantity);
                entry.timestamp_ms = Some(trade.timestamp_ms);
                trade.symbol
            }
            crate::parser::ParsedFrame::Unknown => return,
        };

        let Some(slot) = assembly.get(&pair) else {
            return;
        };
        let (Some(bid), Some(ask), Some(last)) = (slot.bid, slot.ask, slot.last) else {
            // Still assembling the first complete quote for this pair.
            return;
        };

        let timestamp = slot
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let event = MarketEvent {
            pair,
            timestamp,
            bid,
            ask,
            last,
            volume: slot.volume,
        };

        debug!(pair = %event.pair, bid = %bid, ask = %ask, last = %last, "market event");
        self.price_book.update(&event);
        // No receivers is fine; the bus is lossy by design.
        let _ = self.market_tx.send(event);
    }

    async fn request_audit(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.audit_tx.send(AuditRequest { ack: ack_tx }).await.is_err() {
            warn!("audit channel closed, resuming without reconciliation");
            return;
        }
        if ack_rx.await.is_err() {
            warn!("audit ack dropped, resuming without reconciliation");
        }
    }
}

/// Waits out a backoff delay; true means shutdown arrived first.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}

fn stream_url(base: &str, pairs: &[String]) -> String {
    let streams: Vec<String> = pairs
        .iter()
        .flat_map(|p| {
            let lower = p.to_lowercase();
            [format!("{lower}@bookTicker"), format!("{lower}@aggTrade")]
        })
        .collect();
    format!("{base}/stream?streams={}", streams.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_interleaves_both_streams_per_pair() {
        let url = stream_url(
            "wss://stream.binance.com:9443",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/btcusdt@aggTrade/ethusdt@bookTicker/ethusdt@aggTrade"
        );
    }
}
