use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-of-book update from a `@bookTicker` stream.
#[derive(Debug, Deserialize)]
pub struct BookTickerRaw {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid: Decimal,
    #[serde(rename = "a")]
    pub ask: Decimal,
}

/// Aggregated trade from an `@aggTrade` stream.
#[derive(Debug, Deserialize)]
pub struct AggTradeRaw {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "T")]
    pub timestamp_ms: i64,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamWrapper {
    stream: String,
    data: serde_json::Value,
}

/// A decoded market frame.
#[derive(Debug)]
pub enum ParsedFrame {
    BookTicker(BookTickerRaw),
    AggTrade(AggTradeRaw),
    Unknown,
}

/// Decode one WebSocket text frame.
///
/// Handles both the combined-stream envelope (`{"stream": ..., "data":
/// ...}`) and raw single-stream payloads. Anything unrecognised maps to
/// `Unknown` rather than an error so control frames and subscription acks
/// pass through silently.
pub fn parse_frame(text: &str) -> Result<ParsedFrame, serde_json::Error> {
    if text.contains("\"stream\"") {
        let wrapper: CombinedStreamWrapper = serde_json::from_str(text)?;
        if wrapper.stream.ends_with("@bookTicker") {
            return Ok(ParsedFrame::BookTicker(serde_json::from_value(wrapper.data)?));
        }
        if wrapper.stream.ends_with("@aggTrade") {
            return Ok(ParsedFrame::AggTrade(serde_json::from_value(wrapper.data)?));
        }
        return Ok(ParsedFrame::Unknown);
    }

    let raw: serde_json::Value = serde_json::from_str(text)?;
    match raw.get("e").and_then(|v| v.as_str()) {
        Some("aggTrade") => Ok(ParsedFrame::AggTrade(serde_json::from_value(raw)?)),
        Some(_) => Ok(ParsedFrame::Unknown),
        // Raw bookTicker payloads carry no event-type tag.
        None if raw.get("b").is_some() && raw.get("a").is_some() && raw.get("s").is_some() => {
            Ok(ParsedFrame::BookTicker(serde_json::from_value(raw)?))
        }
        None => Ok(ParsedFrame::Unknown),
    }
}
