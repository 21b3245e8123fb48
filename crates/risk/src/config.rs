use rust_decimal::Decimal;

/// Per-order exposure cap: a fixed dollar amount or a slice of the
/// current portfolio value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureLimit {
    AbsoluteUsd(Decimal),
    PortfolioFraction(Decimal),
}

impl ExposureLimit {
    pub fn resolve(&self, portfolio_value: Decimal) -> Decimal {
        match self {
            Self::AbsoluteUsd(limit) => *limit,
            Self::PortfolioFraction(fraction) => *fraction * portfolio_value,
        }
    }
}

/// Operator-tunable risk parameters. All percentages are fractions
/// (0.02 = 2%).
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Loss on a position that forces an automatic close.
    pub stop_loss_pct: Decimal,
    /// Gain on a position that forces an automatic close.
    pub take_profit_pct: Decimal,
    pub max_exposure_per_trade: ExposureLimit,
    /// Decline from the portfolio peak that trips the circuit breaker.
    pub max_drawdown_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: Decimal::new(2, 2),
            take_profit_pct: Decimal::new(4, 2),
            max_exposure_per_trade: ExposureLimit::AbsoluteUsd(Decimal::from(1_000)),
            max_drawdown_pct: Decimal::new(10, 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_absolute_limit_ignores_portfolio() {
        let limit = ExposureLimit::AbsoluteUsd(dec!(1000));
        assert_eq!(limit.resolve(dec!(50)), dec!(1000));
        assert_eq!(limit.resolve(dec!(1_000_000)), dec!(1000));
    }

    #[test]
    fn test_fractional_limit_scales_with_portfolio() {
        let limit = ExposureLimit::PortfolioFraction(dec!(0.1));
        assert_eq!(limit.resolve(dec!(10000)), dec!(1000));
        assert_eq!(limit.resolve(dec!(500)), dec!(50));
    }
}
