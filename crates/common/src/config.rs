use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

use model::TradingMode;

/// Startup configuration error. The runner prints it and exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    Missing(&'static str),

    #[error("environment variable '{key}' has invalid value '{value}': {detail}")]
    Invalid {
        key: &'static str,
        value: String,
        detail: String,
    },
}

/// Process configuration, resolved once at startup from the environment
/// (a `.env` file is honoured when present). Immutable for the process
/// lifetime; only the strategy file supports hot reload.
#[derive(Debug, Clone)]
pub struct Config {
    pub trading_mode: TradingMode,
    /// Simulated adverse price offset applied by the paper client.
    pub paper_slippage_bps: Decimal,
    pub database_url: String,
    pub strategy_config_path: String,
    /// Seed portfolio value used for drawdown and percentage exposure.
    pub portfolio_value_usd: Decimal,

    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    /// Absolute per-order notional cap; ignored when the percentage cap is set.
    pub max_exposure_per_trade_usd: Option<Decimal>,
    /// Per-order cap as a fraction of current portfolio value.
    pub max_exposure_per_trade_pct: Option<Decimal>,
    pub max_drawdown_pct: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mode_raw = required("TRADING_MODE")?;
        let trading_mode =
            TradingMode::from_str(&mode_raw).map_err(|detail| ConfigError::Invalid {
                key: "TRADING_MODE",
                value: mode_raw,
                detail,
            })?;

        Ok(Self {
            trading_mode,
            paper_slippage_bps: decimal_or("PAPER_SLIPPAGE_BPS", Decimal::from(10))?,
            database_url: required("DATABASE_URL")?,
            strategy_config_path: std::env::var("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|_| "config/strategies.toml".to_string()),
            portfolio_value_usd: decimal_or("PORTFOLIO_VALUE_USD", Decimal::from(10_000))?,
            stop_loss_pct: decimal_or("STOP_LOSS_PCT", Decimal::new(2, 2))?,
            take_profit_pct: decimal_or("TAKE_PROFIT_PCT", Decimal::new(4, 2))?,
            max_exposure_per_trade_usd: optional_decimal("MAX_EXPOSURE_PER_TRADE_USD")?,
            max_exposure_per_trade_pct: optional_decimal("MAX_EXPOSURE_PER_TRADE_PCT")?,
            max_drawdown_pct: decimal_or("MAX_DRAWDOWN_PCT", Decimal::new(10, 2))?,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional_decimal(key: &'static str) -> Result<Option<Decimal>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => Decimal::from_str(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw,
                detail: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn decimal_or(key: &'static str, default: Decimal) -> Result<Decimal, ConfigError> {
    Ok(optional_decimal(key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_mode_is_rejected() {
        let err = TradingMode::from_str("backtest").unwrap_err();
        assert!(err.contains("backtest"));
    }

    #[test]
    fn test_decimal_defaults() {
        // Unset key falls back to the provided default.
        std::env::remove_var("COMMON_CONFIG_TEST_UNSET");
        let value = decimal_or("COMMON_CONFIG_TEST_UNSET", Decimal::new(10, 2)).unwrap();
        assert_eq!(value, Decimal::new(10, 2));
    }
}
