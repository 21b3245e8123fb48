use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::StrategyError;

/// Strategy list loaded from TOML, e.g.:
///
/// ```toml
/// [[strategy]]
/// type = "rsi"
/// name = "btc-rsi-14"
/// pair = "BTCUSDT"
/// quantity = 0.001
///
/// [strategy.params]
/// period = 14
/// overbought = 70.0
/// oversold = 30.0
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyFileConfig {
    #[serde(rename = "strategy", default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Strategy type identifier: "rsi" or "macd".
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub pair: String,
    /// Order quantity in base asset units.
    pub quantity: Decimal,
    /// Indicator parameters; unset keys use the indicator defaults.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

impl StrategyFileConfig {
    pub fn load(path: &str) -> Result<Self, StrategyError> {
        let content = std::fs::read_to_string(path).map_err(|source| StrategyError::ConfigRead {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| StrategyError::ConfigParse {
            path: path.to_string(),
            source,
        })
    }

    /// Distinct pairs referenced by the configured strategies, in first-seen
    /// order; this is the stream subscription list.
    pub fn pairs(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.strategies
            .iter()
            .filter(|s| seen.insert(s.pair.clone()))
            .map(|s| s.pair.clone())
            .collect()
    }
}

impl StrategyConfig {
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params
            .get(key)
            .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
            .unwrap_or(default)
    }

    pub fn param_usize(&self, key: &str, default: usize) -> usize {
        self.params
            .get(key)
            .and_then(|v| v.as_integer())
            .map(|v| v as usize)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_strategy_file() {
        let raw = r#"
            [[strategy]]
            type = "rsi"
            name = "btc-rsi"
            pair = "BTCUSDT"
            quantity = 0.04

            [strategy.params]
            period = 14

            [[strategy]]
            type = "macd"
            name = "eth-macd"
            pair = "ETHUSDT"
            quantity = 0.5
        "#;

        let config: StrategyFileConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.strategies[0].kind, "rsi");
        assert_eq!(config.strategies[0].quantity, dec!(0.04));
        assert_eq!(config.strategies[0].param_usize("period", 0), 14);
        assert_eq!(config.pairs(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn test_duplicate_pairs_deduplicated() {
        let raw = r#"
            [[strategy]]
            type = "rsi"
            name = "a"
            pair = "BTCUSDT"
            quantity = 0.01

            [[strategy]]
            type = "macd"
            name = "b"
            pair = "BTCUSDT"
            quantity = 0.01
        "#;

        let config: StrategyFileConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.pairs(), vec!["BTCUSDT"]);
    }
}
