/// Incremental exponential moving average, seeded with the first sample.
#[derive(Debug, Clone)]
struct Ema {
    period: usize,
    value: Option<f64>,
}

impl Ema {
    fn new(period: usize) -> Self {
        Self {
            period,
            value: None,
        }
    }

    fn update(&mut self, sample: f64) -> f64 {
        let k = 2.0 / (self.period as f64 + 1.0);
        let next = match self.value {
            Some(prev) => sample * k + prev * (1.0 - k),
            None => sample,
        };
        self.value = Some(next);
        next
    }
}

/// Crossover verdict for the latest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdCross {
    /// MACD line crossed above the signal line on this sample.
    Bullish,
    /// MACD line crossed below the signal line on this sample.
    Bearish,
    Neutral,
}

/// Moving Average Convergence/Divergence.
///
/// MACD line = EMA(fast) − EMA(slow); signal line = EMA of the MACD line.
/// Returns `None` until `slow + signal` samples have stabilised the EMAs,
/// then reports crossings of the two lines — exactly on the crossing tick.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    warmup: usize,
    samples: usize,
    prev: Option<(f64, f64)>,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        assert!(fast < slow, "MACD fast period must be below the slow period");
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
            warmup: slow + signal,
            samples: 0,
            prev: None,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<MacdCross> {
        self.samples += 1;

        let macd_line = self.fast.update(price) - self.slow.update(price);
        let signal_line = self.signal.update(macd_line);
        let prev = self.prev.replace((macd_line, signal_line));

        if self.samples < self.warmup {
            return None;
        }
        let (prev_macd, prev_signal) = prev?;

        if prev_macd <= prev_signal && macd_line > signal_line {
            Some(MacdCross::Bullish)
        } else if prev_macd >= prev_signal && macd_line < signal_line {
            Some(MacdCross::Bearish)
        } else {
            Some(MacdCross::Neutral)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_during_warmup() {
        let mut macd = Macd::new(12, 26, 9);
        for i in 0..34 {
            assert!(macd.update(100.0 + i as f64).is_none(), "sample {i}");
        }
        assert!(macd.update(134.0).is_some());
    }

    #[test]
    fn test_bullish_cross_fires_once_on_reversal() {
        let mut macd = Macd::new(3, 6, 3);

        // Decline long enough to clear the warmup with MACD under signal
        let mut crosses = Vec::new();
        for i in 0..30 {
            if let Some(c) = macd.update(200.0 - i as f64) {
                crosses.push(c);
            }
        }
        assert!(crosses.iter().all(|c| *c != MacdCross::Bullish));

        // Sharp reversal upward produces exactly one bullish crossing
        let mut bullish = 0;
        for i in 0..30 {
            if macd.update(170.0 + i as f64 * 3.0) == Some(MacdCross::Bullish) {
                bullish += 1;
            }
        }
        assert_eq!(bullish, 1);
    }

    #[test]
    fn test_bearish_cross_on_downturn() {
        let mut macd = Macd::new(3, 6, 3);
        for i in 0..30 {
            macd.update(100.0 + i as f64 * 2.0);
        }

        let mut bearish = 0;
        for i in 0..30 {
            if macd.update(160.0 - i as f64 * 3.0) == Some(MacdCross::Bearish) {
                bearish += 1;
            }
        }
        assert_eq!(bearish, 1);
    }

    #[test]
    fn test_steady_trend_stays_neutral_after_initial_cross() {
        let mut macd = Macd::new(3, 6, 3);
        let mut crossings = 0;
        for i in 0..100 {
            match macd.update(100.0 + i as f64 * 0.5) {
                Some(MacdCross::Bullish) | Some(MacdCross::Bearish) => crossings += 1,
                _ => {}
            }
        }
        // A linear trend keeps MACD on one side of its signal line
        assert!(crossings <= 1, "unexpected crossings: {crossings}");
    }
}
