/// Relative Strength Index with Wilder smoothing, computed incrementally.
///
/// Returns `None` until `period` price changes have been observed; the
/// first value seeds the averages with the plain mean of the initial
/// changes, after which Wilder's recurrence takes over.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_price: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    changes: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        assert!(period >= 2, "RSI period must be >= 2");
        Self {
            period,
            prev_price: None,
            avg_gain: 0.0,
            avg_loss: 0.0,
            changes: 0,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        let prev = match self.prev_price.replace(price) {
            Some(p) => p,
            None => return None,
        };

        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        self.changes += 1;
        let period = self.period as f64;

        if self.changes <= self.period {
            self.avg_gain += gain / period;
            self.avg_loss += loss / period;
            if self.changes < self.period {
                return None;
            }
        } else {
            self.avg_gain = (self.avg_gain * (period - 1.0) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - 1.0) + loss) / period;
        }

        if self.avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = self.avg_gain / self.avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rsi: &mut Rsi, prices: &[f64]) -> Option<f64> {
        let mut last = None;
        for &p in prices {
            last = rsi.update(p);
        }
        last
    }

    #[test]
    fn test_none_until_period_changes_seen() {
        let mut rsi = Rsi::new(14);
        // 14 prices = 13 changes, one short of the warmup
        for i in 0..14 {
            assert!(rsi.update(100.0 + i as f64).is_none());
        }
        assert!(rsi.update(114.0).is_some());
    }

    #[test]
    fn test_all_gains_pin_at_100() {
        let mut rsi = Rsi::new(3);
        let value = feed(&mut rsi, &[10.0, 11.0, 12.0, 13.0, 14.0]).unwrap();
        assert!((value - 100.0).abs() < 1e-9, "expected 100, got {value}");
    }

    #[test]
    fn test_all_losses_pin_at_0() {
        let mut rsi = Rsi::new(3);
        let value = feed(&mut rsi, &[14.0, 13.0, 12.0, 11.0, 10.0]).unwrap();
        assert!(value.abs() < 1e-9, "expected 0, got {value}");
    }

    #[test]
    fn test_value_stays_in_range_on_mixed_series() {
        let mut rsi = Rsi::new(14);
        let prices = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.15, 45.97, 46.45, 45.84, 46.08,
            45.89, 46.03, 45.61, 46.28, 46.28,
        ];
        let value = feed(&mut rsi, &prices).unwrap();
        assert!((0.0..=100.0).contains(&value), "RSI out of range: {value}");
    }

    #[test]
    fn test_wilder_smoothing_dampens_single_spike() {
        let mut a = Rsi::new(14);
        let mut b = Rsi::new(2);
        let mut prices: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect();
        prices.push(105.0);

        let slow = feed(&mut a, &prices).unwrap();
        let fast = feed(&mut b, &prices).unwrap();
        // The short period reacts harder to the spike than the long one
        assert!(fast >= slow);
    }
}
